use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use glam::DVec3;
use glam::UVec3;
use log::debug;
use log::info;
use log::warn;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::PointCloud;
use crate::augment::write_flipped;
use crate::bbox::Bounds;
use crate::config::CubeConfig;
use crate::config::TierConfig;
use crate::error::ConfigError;
use crate::error::GenerateError;
use crate::io::save_cell;
use crate::key::CELL_EXTENSION;
use crate::key::CellKey;
use crate::key::FLIP_MARKER;

/// Below this fraction of the cloud's height a warning is logged.
const LOW_VERTICAL_COVERAGE: f64 = 0.8;

/// Suffix of a cell file while it is being written.
const PARTIAL_SUFFIX: &str = "partial";

/// A kept cell: its key, its box and its own copy of the points.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    /// Name of the cell.
    pub key: CellKey,
    /// The cell's half-open box.
    pub bounds: Bounds,
    /// The points, after downsampling.
    pub cloud: PointCloud,
    /// Number of points in the box before downsampling.
    pub original_count: usize,
}

impl Cell {
    /// True when the cell was randomly reduced to the tier's target.
    #[must_use]
    pub fn is_downsampled(&self) -> bool {
        self.cloud.len() < self.original_count
    }

    /// The coordinates.
    #[must_use]
    pub fn points(&self) -> &[DVec3] {
        self.cloud.points()
    }
}

/// Shared flag polled between cells. Raise it to abort generation.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Request cancellation, returning true when it had already been requested.
    pub fn raise(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    /// True once [`CancelFlag::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per tier diagnostics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierReport {
    /// Zero based tier index.
    pub tier: usize,
    /// Cube edge length.
    pub edge_length: f64,
    /// Grid origin after applying the offset.
    pub origin: DVec3,
    /// Cells per axis.
    pub dims: UVec3,
    /// Cells written, including downsampled ones.
    pub kept: usize,
    /// Cells without a point.
    pub empty: usize,
    /// Cells below `min_points`.
    pub sparse: usize,
    /// Cells above `max_points`, reduced to `target_points`.
    pub downsampled: usize,
    /// Points in kept cells.
    pub points_kept: usize,
}

/// Diagnostics for a whole generation run. A quality signal, never an error.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationReport {
    /// Points in the source cloud.
    pub input_points: usize,
    /// One entry per tier.
    pub tiers: Vec<TierReport>,
    /// Smallest kept cell.
    pub min_cell_points: Option<usize>,
    /// Largest kept cell.
    pub max_cell_points: Option<usize>,
    /// Spread of cell mean heights over the cloud's height.
    ///
    /// `None` when nothing was kept or the cloud is flat.
    pub vertical_coverage: Option<f64>,
    /// Cell files written. Empty for an in-memory cut.
    pub files: Vec<PathBuf>,
}

impl GenerationReport {
    /// Cells kept over all tiers.
    #[must_use]
    pub fn cells_kept(&self) -> usize {
        self.tiers.iter().map(|t| t.kept).sum()
    }

    /// Points kept over all tiers. Overlapping tiers count a point once per tier.
    #[must_use]
    pub fn points_kept(&self) -> usize {
        self.tiers.iter().map(|t| t.points_kept).sum()
    }

    /// Kept points over input points, 0 for an empty input.
    #[must_use]
    pub fn coverage_ratio(&self) -> f64 {
        if self.input_points == 0 {
            0.0
        } else {
            self.points_kept() as f64 / self.input_points as f64
        }
    }

    /// Mean kept cell size.
    #[must_use]
    pub fn mean_cell_points(&self) -> Option<f64> {
        let cells = self.cells_kept();
        (cells > 0).then(|| self.points_kept() as f64 / cells as f64)
    }

    fn log_summary(&self) {
        for t in &self.tiers {
            info!(
                "tier v{} edge {} dims {}: kept {} (downsampled {}), empty {}, sparse {}",
                t.tier + 1,
                t.edge_length,
                t.dims,
                t.kept,
                t.downsampled,
                t.empty,
                t.sparse
            );
        }
        info!(
            "{} cubes, {} points, coverage {:.1}% of {} input points",
            self.cells_kept(),
            self.points_kept(),
            self.coverage_ratio() * 100.0,
            self.input_points
        );
        if let (Some(min), Some(max), Some(mean)) = (
            self.min_cell_points,
            self.max_cell_points,
            self.mean_cell_points(),
        ) {
            info!("points per cube: min {min}, max {max}, mean {mean:.0}");
        }
        if let Some(coverage) = self.vertical_coverage {
            info!("vertical coverage {:.1}%", coverage * 100.0);
            if coverage < LOW_VERTICAL_COVERAGE {
                warn!(
                    "low vertical coverage {:.1}%: parts of the object will be missing, consider lowering min_points",
                    coverage * 100.0
                );
            }
        }
    }
}

/// The regular grid of one tier.
///
/// Planes along each axis lie at `origin + n * cell_size`. Cell `n` spans
/// `[plane(n), plane(n + 1))`; both ends come from the same expression so
/// neighbouring cells share their face exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Grid {
    cell_size: f64,
    origin: DVec3,
    dims: UVec3,
}

impl Grid {
    /// The grid with planes at `lower + offset + n * cell_size` covering
    /// `[lower, upper]`.
    pub(crate) fn new(
        lower: DVec3,
        upper: DVec3,
        cell_size: f64,
        offset: DVec3,
        tier: usize,
    ) -> Result<Self, GenerateError> {
        let mut origin = DVec3::ZERO;
        let mut cells = [0_f64; 3];
        for a in 0..3 {
            let phase = offset[a].rem_euclid(cell_size);
            let mut o = lower[a] + phase;
            while o > lower[a] {
                o -= cell_size;
            }
            origin[a] = o;
            cells[a] = ((upper[a] - o) / cell_size).floor() + 1.0;
        }
        let limit = f64::from(u32::MAX / 2);
        if cells.iter().any(|c| !c.is_finite() || *c >= limit) {
            return Err(GenerateError::GridTooLarge { tier, cells });
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut grid = Self {
            cell_size,
            origin,
            dims: UVec3::new(cells[0] as u32, cells[1] as u32, cells[2] as u32),
        };
        // Rounding may leave the maximum on or beyond the last plane.
        for a in 0..3 {
            while grid.plane(a, grid.dims[a]) <= upper[a] {
                grid.dims[a] += 1;
            }
        }
        Ok(grid)
    }

    fn plane(&self, axis: usize, n: u32) -> f64 {
        f64::from(n).mul_add(self.cell_size, self.origin[axis])
    }

    pub(crate) fn bounds(&self, index: [u32; 3]) -> Bounds {
        let lower = DVec3::new(
            self.plane(0, index[0]),
            self.plane(1, index[1]),
            self.plane(2, index[2]),
        );
        let upper = DVec3::new(
            self.plane(0, index[0] + 1),
            self.plane(1, index[1] + 1),
            self.plane(2, index[2] + 1),
        );
        Bounds::from_corners(lower, upper)
    }

    /// The cell whose box contains `point`, `None` outside the grid.
    ///
    /// The arithmetic estimate is nudged until the box predicate agrees, so
    /// membership is decided by [`Bounds::contains`] alone.
    pub(crate) fn cell_index(&self, point: DVec3) -> Option<[u32; 3]> {
        let mut index = [0_u32; 3];
        for a in 0..3 {
            let last = self.dims[a] - 1;
            let estimate = ((point[a] - self.origin[a]) / self.cell_size).floor();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let mut n = estimate.clamp(0.0, f64::from(last)) as u32;
            while n > 0 && point[a] < self.plane(a, n) {
                n -= 1;
            }
            while n < last && point[a] >= self.plane(a, n + 1) {
                n += 1;
            }
            index[a] = n;
        }
        self.bounds(index).contains(point).then_some(index)
    }

    pub(crate) const fn dims(&self) -> UVec3 {
        self.dims
    }

    pub(crate) const fn origin(&self) -> DVec3 {
        self.origin
    }

    fn cell_count(&self) -> u64 {
        u64::from(self.dims.x) * u64::from(self.dims.y) * u64::from(self.dims.z)
    }
}

enum Outcome {
    Sparse,
    Kept(Cell),
}

/// Cuts a cloud into the cells of every configured tier.
#[derive(Clone, Debug)]
pub struct CubeGenerator {
    config: CubeConfig,
    cancel: CancelFlag,
}

impl CubeGenerator {
    /// Constructor
    ///
    /// # Errors
    ///   When a tier is malformed. Nothing has been written at this point.
    pub fn new(config: CubeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancelFlag::default(),
        })
    }

    /// Share a cancel flag with the caller.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &CubeConfig {
        &self.config
    }

    /// Partition `cloud` in memory.
    ///
    /// Cells come out tier by tier, in grid index order. An empty cloud
    /// yields no cells.
    ///
    /// # Errors
    ///   When cancelled, or a tier's grid is too large to index.
    pub fn cut(&self, cloud: &PointCloud) -> Result<(Vec<Cell>, GenerationReport), GenerateError> {
        let mut report = GenerationReport {
            input_points: cloud.len(),
            ..Default::default()
        };
        let Some((lower, upper)) = cloud.extent() else {
            info!("empty cloud, no cubes to cut");
            return Ok((Vec::new(), report));
        };

        let mut cells = Vec::new();
        for (tier, tier_config) in self.config.tiers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            let (tier_cells, tier_report) = self.cut_tier(cloud, lower, upper, tier, tier_config)?;
            cells.extend(tier_cells);
            report.tiers.push(tier_report);
        }

        report.min_cell_points = cells.iter().map(|c| c.cloud.len()).min();
        report.max_cell_points = cells.iter().map(|c| c.cloud.len()).max();
        report.vertical_coverage = vertical_coverage(&cells, upper.z - lower.z);
        Ok((cells, report))
    }

    fn cut_tier(
        &self,
        cloud: &PointCloud,
        lower: DVec3,
        upper: DVec3,
        tier: usize,
        config: &TierConfig,
    ) -> Result<(Vec<Cell>, TierReport), GenerateError> {
        let grid = Grid::new(lower, upper, config.edge_length, config.offset_vec(), tier)?;
        debug!(
            "tier v{}: edge {} origin {} dims {}",
            tier + 1,
            config.edge_length,
            grid.origin(),
            grid.dims()
        );

        let mut bins: BTreeMap<[u32; 3], Vec<usize>> = BTreeMap::new();
        for (i, p) in cloud.points().iter().enumerate() {
            if let Some(index) = grid.cell_index(*p) {
                bins.entry(index).or_default().push(i);
            }
        }
        let bins: Vec<([u32; 3], Vec<usize>)> = bins.into_iter().collect();

        let outcomes: Vec<Outcome> = bins
            .par_iter()
            .map(|(index, members)| {
                let key = CellKey::new(tier, *index);
                self.apply_policy(cloud, key, grid.bounds(*index), members, config)
            })
            .collect();

        if self.cancel.is_cancelled() {
            return Err(GenerateError::Cancelled);
        }

        let mut report = TierReport {
            tier,
            edge_length: config.edge_length,
            origin: grid.origin(),
            dims: grid.dims(),
            empty: usize::try_from(grid.cell_count() - bins.len() as u64)
                .unwrap_or(usize::MAX),
            ..Default::default()
        };
        let mut cells = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Sparse => report.sparse += 1,
                Outcome::Kept(cell) => {
                    report.kept += 1;
                    report.points_kept += cell.cloud.len();
                    if cell.is_downsampled() {
                        report.downsampled += 1;
                    }
                    cells.push(cell);
                }
            }
        }
        Ok((cells, report))
    }

    fn apply_policy(
        &self,
        cloud: &PointCloud,
        key: CellKey,
        bounds: Bounds,
        members: &[usize],
        config: &TierConfig,
    ) -> Outcome {
        let n = members.len();
        if n < config.min_points {
            debug!("{key}: {n} points, sparse");
            return Outcome::Sparse;
        }
        let cell_cloud = if n > config.max_points {
            let mut rng = cell_rng(self.config.seed, &key);
            let picked = downsample(members, config.target_points, &mut rng);
            debug!("{key}: {n} points, downsampled to {}", picked.len());
            cloud.select(&picked)
        } else {
            cloud.select(members)
        };
        Outcome::Kept(Cell {
            key,
            bounds,
            cloud: cell_cloud,
            original_count: n,
        })
    }

    /// Cut `cloud` and write one cell file per kept cell into `cube_dir`,
    /// followed by the flipped duplicates when augmentation is enabled.
    ///
    /// Cell files already in `cube_dir` are removed first, so afterwards it
    /// holds the cells of `cloud` only. On cancellation or any error, every
    /// file written by this call is removed before returning.
    ///
    /// # Errors
    ///   When cancelled, or a cell file cannot be removed or written.
    pub fn generate(
        &self,
        cloud: &PointCloud,
        cube_dir: &Path,
    ) -> Result<GenerationReport, GenerateError> {
        info!(
            "cutting {} points into {} tiers",
            cloud.len(),
            self.config.tiers.len()
        );
        let (cells, mut report) = self.cut(cloud)?;
        clear_cells(cube_dir)?;
        report.files = self.write_cells(&cells, cube_dir)?;
        if self.config.augment {
            match write_flipped(&cells, cube_dir, &self.cancel) {
                Ok(flipped) => {
                    info!("wrote {} flipped cells", flipped.len());
                    report.files.extend(flipped);
                }
                Err(e) => {
                    remove_all(&report.files);
                    return Err(e);
                }
            }
        }
        report.log_summary();
        Ok(report)
    }

    /// Write cells into `cube_dir`, all or nothing.
    ///
    /// # Errors
    ///   When cancelled, or a cell file cannot be written.
    pub fn write_cells(&self, cells: &[Cell], cube_dir: &Path) -> Result<Vec<PathBuf>, GenerateError> {
        fs::create_dir_all(cube_dir).map_err(|source| GenerateError::Io {
            path: cube_dir.to_path_buf(),
            source,
        })?;
        write_all_or_nothing(cells, &self.cancel, |cell| {
            let path = cube_dir.join(cell.key.file_name());
            write_atomically(&path, cell.points())?;
            Ok(path)
        })
    }
}

/// Runs `write` over `items` in parallel.
///
/// If any call fails, or `cancel` is raised, the files of the successful
/// calls are removed and the first error is returned.
pub(crate) fn write_all_or_nothing<T, F>(
    items: &[T],
    cancel: &CancelFlag,
    write: F,
) -> Result<Vec<PathBuf>, GenerateError>
where
    T: Sync,
    F: Fn(&T) -> Result<PathBuf, GenerateError> + Sync,
{
    let results: Vec<Result<PathBuf, GenerateError>> = items
        .par_iter()
        .map(|item| {
            if cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            write(item)
        })
        .collect();

    let mut written = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(path) => written.push(path),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if first_error.is_none() && cancel.is_cancelled() {
        first_error = Some(GenerateError::Cancelled);
    }

    match first_error {
        None => Ok(written),
        Some(e) => {
            warn!("{e}: removing {} cell files", written.len());
            remove_all(&written);
            Err(e)
        }
    }
}

/// Removes the cell files, flipped or not, and `.partial` leftovers from
/// `cube_dir`. Anything else in the directory is left alone.
fn clear_cells(cube_dir: &Path) -> Result<usize, GenerateError> {
    let io = |source| GenerateError::Io {
        path: cube_dir.to_path_buf(),
        source,
    };
    let entries = match fs::read_dir(cube_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io(e)),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry.map_err(io)?.path();
        if !path.is_file() || !is_cell_file(&path) {
            continue;
        }
        fs::remove_file(&path).map_err(|source| GenerateError::Io {
            path: path.clone(),
            source,
        })?;
        removed += 1;
    }
    if removed > 0 {
        info!("removed {removed} stale cell files from {}", cube_dir.display());
    }
    Ok(removed)
}

fn is_cell_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name
        .strip_suffix(PARTIAL_SUFFIX)
        .and_then(|n| n.strip_suffix('.'))
        .unwrap_or(name);
    match name.strip_suffix(&format!(".{CELL_EXTENSION}")) {
        Some(stem) => stem.parse::<CellKey>().is_ok(),
        // cube_i_j_k_v{n}.txt_flip
        None => {
            name.ends_with(&format!(".{CELL_EXTENSION}{FLIP_MARKER}"))
                && name.parse::<CellKey>().is_ok()
        }
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!("could not remove {}: {e}", path.display());
        }
    }
}

/// Writes a cell file under a temporary name, then renames it into place,
/// so an interrupted write never leaves a truncated `.txt` behind.
pub(crate) fn write_atomically(path: &Path, points: &[DVec3]) -> Result<(), GenerateError> {
    let io = |source| GenerateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut partial = path.as_os_str().to_owned();
    partial.push(".");
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    if let Err(e) = save_cell(&partial, points) {
        let _ = fs::remove_file(&partial);
        return Err(io(e));
    }
    if let Err(e) = fs::rename(&partial, path) {
        let _ = fs::remove_file(&partial);
        return Err(io(e));
    }
    Ok(())
}

/// A random stream for one cell.
///
/// With a seed the stream depends only on the seed and the key, so results
/// do not depend on how cells are scheduled across threads.
fn cell_rng(seed: Option<u64>, key: &CellKey) -> StdRng {
    match seed {
        Some(seed) => {
            let mut h = seed;
            for v in [
                key.tier as u64,
                u64::from(key.index[0]),
                u64::from(key.index[1]),
                u64::from(key.index[2]),
            ] {
                h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(v + 1);
                h ^= h >> 29;
            }
            StdRng::seed_from_u64(h)
        }
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// Uniform sample of `target` members without replacement, in their
/// original order.
pub(crate) fn downsample(members: &[usize], target: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut picked = rand::seq::index::sample(rng, members.len(), target).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| members[i]).collect()
}

fn vertical_coverage(cells: &[Cell], height: f64) -> Option<f64> {
    if height <= 0.0 {
        return None;
    }
    let means = cells.iter().filter(|c| !c.cloud.is_empty()).map(|c| {
        c.points().iter().map(|p| p.z).sum::<f64>() / c.cloud.len() as f64
    });
    let (low, high) = means.fold(None, |acc: Option<(f64, f64)>, z| match acc {
        None => Some((z, z)),
        Some((low, high)) => Some((low.min(z), high.max(z))),
    })?;
    Some((high - low) / height)
}
