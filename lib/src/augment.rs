use std::fs;
use std::path::Path;
use std::path::PathBuf;

use glam::DVec3;
use glam::Vec3Swizzles;
use log::debug;
use log::info;

use crate::error::GenerateError;
use crate::generate::CancelFlag;
use crate::generate::Cell;
use crate::generate::write_all_or_nothing;
use crate::generate::write_atomically;
use crate::io::load_cell;
use crate::key::CELL_EXTENSION;
use crate::key::CellKey;

/// Axis order of a flipped point: axis 0 and axis 2 swapped.
pub const FLIP_PERMUTATION: [usize; 3] = [2, 1, 0];

/// Swaps the x and z coordinates.
#[must_use]
pub fn flip(p: DVec3) -> DVec3 {
    p.zyx()
}

/// Undoes [`flip`]. The swap is its own inverse.
#[must_use]
pub fn unflip(p: DVec3) -> DVec3 {
    flip(p)
}

/// The flipped duplicate of a cell.
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentedCell {
    /// The base key with the flip flag set.
    pub key: CellKey,
    /// Points with x and z swapped.
    pub points: Vec<DVec3>,
    /// Always true for a duplicate produced here.
    pub is_flipped: bool,
}

impl AugmentedCell {
    /// Flips a cell.
    #[must_use]
    pub fn from_cell(cell: &Cell) -> Self {
        Self::from_points(cell.key, cell.points())
    }

    fn from_points(key: CellKey, points: &[DVec3]) -> Self {
        Self {
            key: key.flipped(),
            points: points.iter().copied().map(flip).collect(),
            is_flipped: true,
        }
    }

    /// See [`FLIP_PERMUTATION`].
    #[must_use]
    pub const fn permutation(&self) -> [usize; 3] {
        FLIP_PERMUTATION
    }
}

/// One flipped duplicate per cell, in the same order.
#[must_use]
pub fn expand(cells: &[Cell]) -> Vec<AugmentedCell> {
    cells.iter().map(AugmentedCell::from_cell).collect()
}

/// Writes the flipped duplicates of `cells` into `cube_dir`, all or nothing.
pub(crate) fn write_flipped(
    cells: &[Cell],
    cube_dir: &Path,
    cancel: &CancelFlag,
) -> Result<Vec<PathBuf>, GenerateError> {
    write_all_or_nothing(cells, cancel, |cell| {
        let flipped = AugmentedCell::from_cell(cell);
        let path = cube_dir.join(flipped.key.file_name());
        write_atomically(&path, &flipped.points)?;
        Ok(path)
    })
}

/// Reads every unflipped cell file in `cube_dir` and writes its flipped
/// duplicate beside it.
///
/// Files that are not cells, or are already flipped, are left alone.
///
/// # Errors
///   When the directory cannot be listed, a cell cannot be read or a
///   duplicate cannot be written. Duplicates written so far are removed.
pub fn expand_dir(cube_dir: &Path, cancel: &CancelFlag) -> Result<usize, GenerateError> {
    let io = |source| GenerateError::Io {
        path: cube_dir.to_path_buf(),
        source,
    };
    let mut sources: Vec<(CellKey, PathBuf)> = Vec::new();
    for entry in fs::read_dir(cube_dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CELL_EXTENSION) {
            continue;
        }
        match CellKey::from_path(&path) {
            Ok(key) if !key.flipped => sources.push((key, path)),
            Ok(_) => {}
            Err(e) => debug!("skipping {}: {e}", path.display()),
        }
    }
    sources.sort();

    let written = write_all_or_nothing(&sources, cancel, |(key, path)| {
        let points = load_cell(path)?;
        let flipped = AugmentedCell::from_points(*key, &points);
        let target = cube_dir.join(flipped.key.file_name());
        write_atomically(&target, &flipped.points)?;
        Ok(target)
    })?;
    info!("wrote {} flipped cells to {}", written.len(), cube_dir.display());
    Ok(written.len())
}
