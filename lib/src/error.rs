use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Malformed tier geometry or an unreadable configuration file.
///
/// Raised before any file is written.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The tier list is empty.
    #[error("no cube tiers configured")]
    NoTiers,

    /// Edge length is zero, negative or not finite.
    #[error("tier {tier}: edge length must be positive and finite, got {value}")]
    InvalidEdgeLength {
        /// Zero based tier index.
        tier: usize,
        /// The offending edge length.
        value: f64,
    },

    /// Offset has a NaN or infinite component.
    #[error("tier {tier}: offset must be finite, got {offset:?}")]
    InvalidOffset {
        /// Zero based tier index.
        tier: usize,
        /// The offending offset.
        offset: [f64; 3],
    },

    /// `min_points` exceeds `max_points`.
    #[error("tier {tier}: min_points ({min}) exceeds max_points ({max})")]
    InvertedThresholds {
        /// Zero based tier index.
        tier: usize,
        /// Minimum point count.
        min: usize,
        /// Maximum point count.
        max: usize,
    },

    /// `target_points` is zero or above `max_points`.
    #[error("tier {tier}: target_points ({target}) must lie in 1..={max}")]
    InvalidTarget {
        /// Zero based tier index.
        tier: usize,
        /// Downsample target.
        target: usize,
        /// Maximum point count.
        max: usize,
    },

    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// The configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::PipelineConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// The configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Missing, unreadable or unparseable point data.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The file could not be opened or read.
    #[error("failed to access {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A text line (or binary record) could not be decoded.
    #[error("{path}:{line}: {message}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// One based line, or record, number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The PLY header describes something this reader does not handle.
    #[error("{path}: unsupported PLY: {reason}")]
    UnsupportedPly {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The `.npy` header or payload is malformed.
    #[error("{path}: malformed npy: {reason}")]
    Npy {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The extension is not one of ply, xyz, txt, pts, npy.
    #[error("{path}: unrecognised point cloud format")]
    UnknownFormat {
        /// The file.
        path: PathBuf,
    },

    /// A coordinate is NaN or infinite.
    #[error("point {index} has a non-finite coordinate")]
    NonFinite {
        /// Index of the point.
        index: usize,
    },

    /// An attribute column does not match the number of points.
    #[error("attribute {name} has {len} values for {expected} points")]
    AttributeLength {
        /// Column name.
        name: String,
        /// Column length.
        len: usize,
        /// Number of points.
        expected: usize,
    },
}

/// A name that does not decode as a [`crate::CellKey`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    /// The name does not start with `cube_`.
    #[error("{0:?} does not start with \"cube_\"")]
    MissingPrefix(String),

    /// Wrong number of `_` separated fields.
    #[error("{0:?} must have the form cube_<i>_<j>_<k>[_v<tier>][_flip]")]
    FieldCount(String),

    /// A grid index is not an unsigned integer.
    #[error("{name:?}: grid index {field:?} is not an unsigned integer")]
    BadIndex {
        /// The full name.
        name: String,
        /// The offending field.
        field: String,
    },

    /// The tier field is not `v1`, `v2`, ...
    #[error("{name:?}: tier field {field:?} must be v1, v2, ...")]
    BadTier {
        /// The full name.
        name: String,
        /// The offending field.
        field: String,
    },
}

/// Failure while cutting or augmenting cubes.
///
/// Any of these aborts the stage and removes the files written by it.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Invalid tier configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A cell file could not be read back (augmentation).
    #[error(transparent)]
    Read(#[from] CloudError),

    /// A cell file could not be written.
    #[error("failed to write cell {path}: {source}")]
    Io {
        /// The cell file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The extent divided by the edge length does not fit the index type.
    #[error("tier {tier}: grid of {cells:?} cells is too large")]
    GridTooLarge {
        /// Zero based tier index.
        tier: usize,
        /// Cells per axis, as computed.
        cells: [f64; 3],
    },

    /// The cancel flag was raised.
    #[error("cube generation cancelled")]
    Cancelled,
}

/// The external completion step failed.
///
/// Cell files are left untouched, the step may be retried alone.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The process could not be started.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// The program that was launched.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status.
    #[error("inference exited with {status}: {stderr}")]
    Failed {
        /// Exit status.
        status: ExitStatus,
        /// Captured standard error.
        stderr: String,
    },

    /// The process ran past the configured timeout and was killed.
    #[error("inference timed out after {0:?}")]
    TimedOut(Duration),

    /// Waiting on the process, or scanning its output, failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// An assembled cloud could not be written, or the results could not be listed.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The results directory could not be listed.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// The results directory.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An output file could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// The output file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// A completion that was skipped. Never fatal.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{path}: {reason}")]
pub struct PartialResultWarning {
    /// The result directory or file.
    pub path: PathBuf,
    /// Why it was skipped.
    pub reason: String,
}

/// Any failure of the end to end driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The source cloud could not be loaded.
    #[error(transparent)]
    Input(#[from] CloudError),

    /// Cube generation failed.
    #[error(transparent)]
    Generate(#[from] GenerateError),

    /// The completion step failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Writing the assembled clouds failed.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    /// The run directories could not be created.
    #[error("failed to prepare run directory {path}: {source}")]
    RunDir {
        /// The directory.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
