use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use glam::DVec3;
use log::debug;
use log::info;
use log::warn;

use crate::config::InferenceConfig;
use crate::error::CloudError;
use crate::error::InferenceError;
use crate::error::PartialResultWarning;
use crate::io::load_npy;
use crate::io::load_xyz;
use crate::key::CELL_EXTENSION;
use crate::key::CellKey;

/// Preferred completion file inside a result directory.
pub const COMPLETION_NPY: &str = "fine.npy";

/// Fallback completion file.
pub const COMPLETION_XYZ: &str = "fine.xyz";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A completion file and the cell it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionEntry {
    /// Decoded from the result directory's name.
    pub key: CellKey,
    /// `fine.npy` or `fine.xyz`.
    pub path: PathBuf,
}

/// The completions found in an inference output directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionManifest {
    /// Usable entries, sorted by key.
    pub entries: Vec<CompletionEntry>,
    /// Directories that were skipped.
    pub warnings: Vec<PartialResultWarning>,
}

impl CompletionManifest {
    /// Lists `out_dir`. Every subdirectory named after a cell and holding a
    /// completion file becomes an entry.
    ///
    /// A missing directory yields an empty manifest.
    ///
    /// # Errors
    ///   When the directory exists but cannot be listed.
    pub fn scan(out_dir: &Path) -> std::io::Result<Self> {
        let mut manifest = Self::default();
        if !out_dir.is_dir() {
            debug!("{} does not exist, no completions", out_dir.display());
            return Ok(manifest);
        }

        for entry in fs::read_dir(out_dir)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let key = match name.parse::<CellKey>() {
                Ok(key) => key,
                Err(e) => {
                    manifest.warn(dir, e.to_string());
                    continue;
                }
            };
            let npy = dir.join(COMPLETION_NPY);
            let xyz = dir.join(COMPLETION_XYZ);
            if npy.is_file() {
                manifest.entries.push(CompletionEntry { key, path: npy });
            } else if xyz.is_file() {
                manifest.entries.push(CompletionEntry { key, path: xyz });
            } else {
                manifest.warn(dir, format!("no {COMPLETION_NPY} or {COMPLETION_XYZ}"));
            }
        }

        manifest.entries.sort();
        manifest.warnings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(manifest)
    }

    fn warn(&mut self, path: PathBuf, reason: String) {
        warn!("skipping {}: {reason}", path.display());
        self.warnings.push(PartialResultWarning { path, reason });
    }

    /// Number of usable entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there is nothing to assemble.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cells in `cell_dir` without a completion.
    ///
    /// # Errors
    ///   When `cell_dir` cannot be listed.
    pub fn missing_from(&self, cell_dir: &Path) -> std::io::Result<Vec<CellKey>> {
        let mut missing = Vec::new();
        for entry in fs::read_dir(cell_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CELL_EXTENSION) {
                continue;
            }
            let Ok(key) = CellKey::from_path(&path) else {
                continue;
            };
            if self.entries.binary_search_by(|e| e.key.cmp(&key)).is_err() {
                missing.push(key);
            }
        }
        missing.sort();
        Ok(missing)
    }
}

/// Reads a completion file, keeping only the coordinates.
///
/// # Errors
///   When the file cannot be read or decoded.
pub fn load_completion(path: &Path) -> Result<Vec<DVec3>, CloudError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => load_npy(path),
        _ => load_xyz(path).map(crate::PointCloud::into_points),
    }
}

/// The black box that turns cell files into completions.
///
/// Implementations write `{out_dir}/{cell stem}/fine.npy` for each cell file
/// in `cell_dir` and must not touch `cell_dir`.
pub trait InferenceEngine {
    /// Runs one batch over every cell file in `cell_dir`.
    ///
    /// # Errors
    ///   See [`InferenceError`].
    fn run_inference(
        &self,
        cell_dir: &Path,
        out_dir: &Path,
        config: &InferenceConfig,
    ) -> Result<CompletionManifest, InferenceError>;
}

/// Launches the completion network as a child process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubprocessInference;

impl SubprocessInference {
    /// The command line of one batch.
    #[must_use]
    pub fn command(cell_dir: &Path, out_dir: &Path, config: &InferenceConfig) -> Command {
        let mut command = Command::new(&config.python);
        command
            .arg(&config.script)
            .arg(&config.model_config)
            .arg(&config.checkpoint)
            .arg("--pc_root")
            .arg(cell_dir)
            .arg("--out_pc_root")
            .arg(out_dir)
            .arg("--device")
            .arg(&config.device);
        if config.formats.npy {
            command.arg("--save_npy");
        }
        if config.formats.ply {
            command.arg("--save_ply");
        }
        if config.formats.xyz {
            command.arg("--save_xyz");
        }
        command
    }
}

impl InferenceEngine for SubprocessInference {
    fn run_inference(
        &self,
        cell_dir: &Path,
        out_dir: &Path,
        config: &InferenceConfig,
    ) -> Result<CompletionManifest, InferenceError> {
        fs::create_dir_all(out_dir).map_err(|source| InferenceError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let mut command = Self::command(cell_dir, out_dir, config);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!("running {command:?}");

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| InferenceError::Spawn {
            program: config.python.clone(),
            source,
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, config.timeout(), out_dir)?;
        let stdout = collect(stdout);
        let stderr = collect(stderr);
        for line in stdout.lines() {
            debug!("inference: {line}");
        }
        if !status.success() {
            return Err(InferenceError::Failed { status, stderr });
        }
        info!("inference finished in {:.1?}", start.elapsed());

        let manifest = CompletionManifest::scan(out_dir).map_err(|source| InferenceError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;
        info!("{} completions in {}", manifest.len(), out_dir.display());
        Ok(manifest)
    }
}

fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Waits for `child`, killing it once `timeout` has elapsed.
///
/// On timeout the drain threads are left to finish on their own.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    out_dir: &Path,
) -> Result<ExitStatus, InferenceError> {
    let io = |source| InferenceError::Io {
        path: out_dir.to_path_buf(),
        source,
    };
    let Some(timeout) = timeout else {
        return child.wait().map_err(io);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(io)? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!("inference exceeded {timeout:?}, killing process {}", child.id());
            if let Err(e) = child.kill() {
                warn!("kill failed: {e}");
            }
            let _ = child.wait();
            return Err(InferenceError::TimedOut(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
