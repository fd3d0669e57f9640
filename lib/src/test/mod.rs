mod assemble;
mod augment;
mod inference;
mod io;

use std::fs;
use std::path::Path;

use glam::DVec3;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::InferenceConfig;
use crate::InferenceError;
use crate::PointCloud;
use crate::inference::COMPLETION_NPY;
use crate::inference::CompletionManifest;
use crate::inference::InferenceEngine;
use crate::io::load_cell;
use crate::io::save_npy;
use crate::key::CellKey;

/// `n` points drawn uniformly from `[min, min + size)` on every axis.
pub(crate) fn uniform_cloud(n: usize, min: f64, size: f64, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let points = (0..n)
        .map(|_| {
            DVec3::new(
                min + rng.random::<f64>() * size,
                min + rng.random::<f64>() * size,
                min + rng.random::<f64>() * size,
            )
        })
        .collect();
    PointCloud::new(points).expect("finite points")
}

/// Writes `points` as the completion of `key` under `results_dir`.
pub(crate) fn write_completion(results_dir: &Path, key: &CellKey, points: &[DVec3]) {
    let dir = results_dir.join(key.to_string());
    fs::create_dir_all(&dir).expect("result dir");
    save_npy(&dir.join(COMPLETION_NPY), points).expect("completion");
}

/// Stands in for the network: the completion of a cell is the cell itself.
#[derive(Debug, Default)]
pub(crate) struct EchoInference;

impl InferenceEngine for EchoInference {
    fn run_inference(
        &self,
        cell_dir: &Path,
        out_dir: &Path,
        _config: &InferenceConfig,
    ) -> Result<CompletionManifest, InferenceError> {
        let io = |source| InferenceError::Io {
            path: cell_dir.to_path_buf(),
            source,
        };
        for entry in fs::read_dir(cell_dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            let Ok(key) = CellKey::from_path(&path) else {
                continue;
            };
            let points = load_cell(&path).expect("cell file");
            write_completion(out_dir, &key, &points);
        }
        CompletionManifest::scan(out_dir).map_err(|source| InferenceError::Io {
            path: out_dir.to_path_buf(),
            source,
        })
    }
}
