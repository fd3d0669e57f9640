use core::fmt;
use core::str::FromStr;
use std::path::Path;

use glam::UVec3;

use crate::error::KeyParseError;

/// Marker appended to the name of an axis-swapped cell.
pub const FLIP_MARKER: &str = "_flip";

/// Extension of cell files.
pub const CELL_EXTENSION: &str = "txt";

const PREFIX: &str = "cube_";

/// Identifies one cell: which tier, where in that tier's grid, and whether
/// it is the flipped duplicate.
///
/// The canonical name is `cube_{i}_{j}_{k}_v{tier + 1}`, followed by
/// [`FLIP_MARKER`] for flipped cells. Decoding also accepts
///
/// * `cube_{i}_{j}_{k}`, the single tier form, read as tier 0;
/// * `cube_{i}_{j}_{k}_v{n}.txt_flip`, where the flip marker was appended to
///   a full file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    /// Zero based tier index.
    pub tier: usize,
    /// Grid index along x, y and z.
    pub index: [u32; 3],
    /// True for the axis-swapped duplicate.
    pub flipped: bool,
}

impl CellKey {
    /// Constructor, for an unflipped cell.
    #[must_use]
    pub const fn new(tier: usize, index: [u32; 3]) -> Self {
        Self {
            tier,
            index,
            flipped: false,
        }
    }

    /// The same cell, flipped.
    #[must_use]
    pub const fn flipped(self) -> Self {
        Self {
            flipped: true,
            ..self
        }
    }

    /// The same cell, unflipped.
    #[must_use]
    pub const fn base(self) -> Self {
        Self {
            flipped: false,
            ..self
        }
    }

    /// Grid index as a vector.
    #[must_use]
    pub const fn index_vec(&self) -> UVec3 {
        UVec3::from_array(self.index)
    }

    /// Name of the cell file, `{key}.txt`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{self}.{CELL_EXTENSION}")
    }

    /// Decodes the key from a path's file stem.
    ///
    /// # Errors
    ///   When the stem is missing or is not a cell name.
    pub fn from_path(path: &Path) -> Result<Self, KeyParseError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        stem.parse()
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [i, j, k] = self.index;
        write!(f, "{PREFIX}{i}_{j}_{k}_v{}", self.tier + 1)?;
        if self.flipped {
            f.write_str(FLIP_MARKER)?;
        }
        Ok(())
    }
}

impl FromStr for CellKey {
    type Err = KeyParseError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let (body, flipped) = match name.strip_suffix(FLIP_MARKER) {
            Some(body) => (body.strip_suffix(".txt").unwrap_or(body), true),
            None => (name, false),
        };

        let rest = body
            .strip_prefix(PREFIX)
            .ok_or_else(|| KeyParseError::MissingPrefix(name.to_string()))?;

        let fields: Vec<&str> = rest.split('_').collect();
        let (index_fields, tier) = match fields.as_slice() {
            [i, j, k] => ([*i, *j, *k], 0),
            [i, j, k, v] => ([*i, *j, *k], parse_tier(name, v)?),
            _ => return Err(KeyParseError::FieldCount(name.to_string())),
        };

        let mut index = [0_u32; 3];
        for (slot, field) in index.iter_mut().zip(index_fields) {
            *slot = parse_canonical(field).ok_or_else(|| KeyParseError::BadIndex {
                name: name.to_string(),
                field: field.to_string(),
            })?;
        }

        Ok(Self {
            tier,
            index,
            flipped,
        })
    }
}

fn parse_tier(name: &str, field: &str) -> Result<usize, KeyParseError> {
    let bad = || KeyParseError::BadTier {
        name: name.to_string(),
        field: field.to_string(),
    };
    let version: usize = field
        .strip_prefix('v')
        .and_then(parse_canonical)
        .ok_or_else(bad)?;
    version.checked_sub(1).ok_or_else(bad)
}

/// Plain decimal digits without sign or leading zeros, so that the name
/// written back by `Display` is the name that was read.
fn parse_canonical<T: FromStr>(field: &str) -> Option<T> {
    let digits = !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit());
    let padded = field.len() > 1 && field.starts_with('0');
    if digits && !padded {
        field.parse().ok()
    } else {
        None
    }
}
