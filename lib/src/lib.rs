#![deny(clippy::all)]
#![warn(clippy::cargo)]
#![warn(clippy::complexity)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::perf)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::cast_precision_loss)]
#![doc = include_str!("../../README.md")]

/// Merge per-cube completions back into whole-object clouds.
pub mod assemble;
/// Axis-swap augmentation of cells.
pub mod augment;
/// Half-open axis aligned boxes and the inclusion mask.
pub mod bbox;
/// Tier, augmentation, assembly and inference parameters.
pub mod config;
/// Error types shared by every stage.
pub mod error;
/// Multi-tier cube cutting.
pub mod generate;
/// The seam to the external completion network.
pub mod inference;
/// Load and Save point clouds, cell files and completions.
pub mod io;
/// Structured cell names.
pub mod key;
/// Run context and the sequential driver.
pub mod pipeline;
#[cfg(test)]
mod test;

use std::collections::BTreeMap;

use glam::DVec3;

pub use assemble::{AssemblyReport, OutputKind, ResultAssembler};
pub use augment::{AugmentedCell, expand, expand_dir, flip, unflip};
pub use bbox::{Bounds, select};
pub use config::{
    AssemblyOptions, CubeConfig, InferenceConfig, MergeStrategy, PipelineConfig, TierConfig,
};
pub use error::{
    AssemblyError, CloudError, ConfigError, GenerateError, InferenceError, KeyParseError,
    PartialResultWarning, PipelineError,
};
pub use generate::{CancelFlag, Cell, CubeGenerator, GenerationReport, TierReport};
pub use inference::{CompletionEntry, CompletionManifest, InferenceEngine, SubprocessInference};
pub use key::CellKey;
pub use pipeline::{Pipeline, RunContext, RunSummary};

/// An ordered set of 3D points with optional per-point scalar attributes.
///
/// Coordinates are always finite. Every attribute column holds exactly one
/// value per point. Transforms never mutate in place, they return a new
/// cloud.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<DVec3>,
    attributes: BTreeMap<String, Vec<f64>>,
}

impl PointCloud {
    /// Constructor
    ///
    /// # Errors
    ///   When a coordinate is NaN or infinite.
    pub fn new(points: Vec<DVec3>) -> Result<Self, CloudError> {
        if let Some(index) = points.iter().position(|p| !p.is_finite()) {
            return Err(CloudError::NonFinite { index });
        }
        Ok(Self {
            points,
            attributes: BTreeMap::new(),
        })
    }

    /// Attach a named scalar column.
    ///
    /// # Errors
    ///   When the column length differs from the number of points.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, CloudError> {
        let name = name.into();
        if values.len() != self.points.len() {
            return Err(CloudError::AttributeLength {
                name,
                len: values.len(),
                expected: self.points.len(),
            });
        }
        self.attributes.insert(name, values);
        Ok(self)
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the cloud holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The coordinates.
    #[must_use]
    pub fn points(&self) -> &[DVec3] {
        &self.points
    }

    /// All attribute columns, by name.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.attributes
    }

    /// A single attribute column.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&[f64]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    /// Consumes the cloud, returning the coordinates.
    #[must_use]
    pub fn into_points(self) -> Vec<DVec3> {
        self.points
    }

    /// Returns a new cloud holding the points at `indices`, in that order.
    ///
    /// # Panics
    ///   When an index is out of range.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        let points = indices.iter().map(|&i| self.points[i]).collect();
        let attributes = self
            .attributes
            .iter()
            .map(|(name, column)| (name.clone(), indices.iter().map(|&i| column[i]).collect()))
            .collect();
        Self { points, attributes }
    }

    /// Returns a new cloud holding the points whose mask entry is true.
    #[must_use]
    pub fn filter(&self, mask: &[bool]) -> Self {
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        self.select(&indices)
    }

    /// The closed extent `(min, max)` of the cloud, `None` when empty.
    #[must_use]
    pub fn extent(&self) -> Option<(DVec3, DVec3)> {
        bbox::extent(&self.points)
    }
}
