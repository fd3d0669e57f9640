use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One resolution level of the cube grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Cube edge length, in the cloud's units.
    pub edge_length: f64,
    /// Grid phase. Grid planes lie at `min + offset + n * edge_length`.
    pub offset: [f64; 3],
    /// Cells with fewer points are dropped as sparse.
    pub min_points: usize,
    /// Cells with more points are downsampled to `target_points`.
    pub max_points: usize,
    /// Size of a downsampled cell.
    pub target_points: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            edge_length: 1.0,
            offset: [0.0; 3],
            min_points: 100,
            max_points: 8192,
            target_points: 3000,
        }
    }
}

impl TierConfig {
    /// A tier with default thresholds.
    #[must_use]
    pub fn new(edge_length: f64, offset: [f64; 3]) -> Self {
        Self {
            edge_length,
            offset,
            ..Default::default()
        }
    }

    /// A tier that keeps every non-empty cell untouched.
    #[must_use]
    pub fn keep_all(edge_length: f64, offset: [f64; 3]) -> Self {
        Self {
            edge_length,
            offset,
            min_points: 0,
            max_points: usize::MAX,
            target_points: usize::MAX,
        }
    }

    /// Set the sparse threshold.
    #[must_use]
    pub const fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    /// Set the dense threshold.
    #[must_use]
    pub const fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }

    /// Set the downsample target.
    #[must_use]
    pub const fn with_target_points(mut self, target_points: usize) -> Self {
        self.target_points = target_points;
        self
    }

    /// The offset as a vector.
    #[must_use]
    pub const fn offset_vec(&self) -> DVec3 {
        DVec3::from_array(self.offset)
    }

    /// Checks geometry and thresholds.
    ///
    /// # Errors
    ///   See [`ConfigError`].
    pub fn validate(&self, tier: usize) -> Result<(), ConfigError> {
        if !(self.edge_length.is_finite() && self.edge_length > 0.0) {
            return Err(ConfigError::InvalidEdgeLength {
                tier,
                value: self.edge_length,
            });
        }
        if !self.offset.iter().all(|v| v.is_finite()) {
            return Err(ConfigError::InvalidOffset {
                tier,
                offset: self.offset,
            });
        }
        if self.min_points > self.max_points {
            return Err(ConfigError::InvertedThresholds {
                tier,
                min: self.min_points,
                max: self.max_points,
            });
        }
        if self.target_points == 0 || self.target_points > self.max_points {
            return Err(ConfigError::InvalidTarget {
                tier,
                target: self.target_points,
                max: self.max_points,
            });
        }
        Ok(())
    }
}

/// Tiers plus augmentation settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeConfig {
    /// Tiers, processed in order. Tier `n` writes `..._v{n + 1}` cells.
    pub tiers: Vec<TierConfig>,
    /// Write an axis-swapped duplicate of every cell.
    pub augment: bool,
    /// Seed for downsampling. `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for CubeConfig {
    /// Four tiers, edge lengths 1.0, 1.0, 1.25 and 1.8, each with its own
    /// grid phase so that cells of one tier straddle the faces of another.
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig::new(1.0, [0.0, 0.0, 0.0]),
                TierConfig::new(1.0, [0.5, 0.5, 0.5]),
                TierConfig::new(1.25, [-0.3, -0.3, -0.3]),
                TierConfig::new(1.8, [0.3, 0.3, 0.2]),
            ],
            augment: true,
            seed: None,
        }
    }
}

impl CubeConfig {
    /// A configuration with a single tier and no augmentation.
    #[must_use]
    pub fn single_tier(tier: TierConfig) -> Self {
        Self {
            tiers: vec![tier],
            augment: false,
            seed: None,
        }
    }

    /// Enable or disable augmentation.
    #[must_use]
    pub const fn with_augment(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    /// Fix the downsampling seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the edge lengths, tier by tier.
    ///
    /// Extra lengths append tiers with default thresholds and no offset,
    /// surplus tiers are dropped. An empty slice changes nothing.
    #[must_use]
    pub fn with_edge_lengths(mut self, lengths: &[f64]) -> Self {
        if lengths.is_empty() {
            return self;
        }
        for (i, &length) in lengths.iter().enumerate() {
            match self.tiers.get_mut(i) {
                Some(tier) => tier.edge_length = length,
                None => self.tiers.push(TierConfig::new(length, [0.0; 3])),
            }
        }
        self.tiers.truncate(lengths.len());
        self
    }

    /// Checks every tier.
    ///
    /// # Errors
    ///   See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        self.tiers
            .iter()
            .enumerate()
            .try_for_each(|(i, tier)| tier.validate(i))
    }
}

/// How the assembler holds the stacked clouds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Stack everything in memory, then write.
    #[default]
    InMemory,
    /// Append each completion to the output files as it is loaded.
    Streaming,
}

/// Which assembled clouds to produce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    /// Write the un-flipped flip completions to their own file.
    pub separate_flipped: bool,
    /// Write main followed by flipped into a third file.
    pub combine_all: bool,
    /// See [`MergeStrategy`].
    pub merge: MergeStrategy,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            separate_flipped: true,
            combine_all: false,
            merge: MergeStrategy::InMemory,
        }
    }
}

/// Files the completion network is asked to write per cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormats {
    /// `fine.npy`, required by the assembler.
    pub npy: bool,
    /// `fine.ply`
    pub ply: bool,
    /// `fine.xyz`
    pub xyz: bool,
}

impl Default for OutputFormats {
    fn default() -> Self {
        Self {
            npy: true,
            ply: false,
            xyz: false,
        }
    }
}

/// How to launch the completion network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Interpreter.
    pub python: String,
    /// Inference entry point.
    pub script: PathBuf,
    /// Model selection: the network's configuration file.
    pub model_config: PathBuf,
    /// Model selection: the trained weights.
    pub checkpoint: PathBuf,
    /// Target device, e.g. `cuda:0` or `cpu`.
    pub device: String,
    /// Requested per-cell output files.
    pub formats: OutputFormats,
    /// Kill the process after this many seconds. `None` waits forever.
    pub timeout_secs: Option<u64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            script: PathBuf::from("tools/inference.py"),
            model_config: PathBuf::from("cfgs/predefhull_models/AdaPoinTr.yaml"),
            checkpoint: PathBuf::from("ckpts/AdaPoinTr_tree_grove_real.pth"),
            device: "cuda:0".to_string(),
            formats: OutputFormats::default(),
            timeout_secs: None,
        }
    }
}

impl InferenceConfig {
    /// The timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Everything a run needs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cube cutting.
    pub cubes: CubeConfig,
    /// Result stitching.
    pub assembly: AssemblyOptions,
    /// The completion network.
    pub inference: InferenceConfig,
}

impl PipelineConfig {
    /// Reads a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///   When the file cannot be read, is not valid JSON, or fails validation.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cube configuration.
    ///
    /// # Errors
    ///   See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cubes.validate()
    }
}
