use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::info;
use log::warn;

use crate::PointCloud;
use crate::assemble::AssemblyReport;
use crate::assemble::ResultAssembler;
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::error::PipelineError;
use crate::generate::CancelFlag;
use crate::generate::CubeGenerator;
use crate::generate::GenerationReport;
use crate::inference::CompletionManifest;
use crate::inference::InferenceEngine;
use crate::io::load_cloud;

/// Name of the cell directory inside a run directory.
pub const CUBES_DIR: &str = "cubes";

/// Name of the inference output directory inside a run directory.
pub const RESULTS_DIR: &str = "inference_results";

/// Where one run keeps its files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunContext {
    /// Root of the run.
    pub run_dir: PathBuf,
    /// Cell files, the input of inference.
    pub cubes_dir: PathBuf,
    /// One subdirectory per completed cell.
    pub results_dir: PathBuf,
}

impl RunContext {
    /// A run rooted at `run_dir`.
    #[must_use]
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            cubes_dir: run_dir.join(CUBES_DIR),
            results_dir: run_dir.join(RESULTS_DIR),
        }
    }

    /// A fresh run at `{base}/{unix seconds}_run`.
    ///
    /// The run directory is created here and never shared: when the name is
    /// taken, `{unix seconds}_{n}_run` is tried with `n = 1, 2, ...`.
    ///
    /// # Errors
    ///   When `base` or the run directory cannot be created.
    pub fn timestamped(base: &Path) -> Result<Self, PipelineError> {
        let run_dir_error = |path: &Path, source| PipelineError::RunDir {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(base).map_err(|e| run_dir_error(base, e))?;

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut attempt = 0_u32;
        loop {
            let name = if attempt == 0 {
                format!("{secs}_run")
            } else {
                format!("{secs}_{attempt}_run")
            };
            let run_dir = base.join(name);
            match fs::create_dir(&run_dir) {
                Ok(()) => return Ok(Self::new(&run_dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(run_dir_error(&run_dir, e)),
            }
        }
    }

    /// Creates the run and cell directories.
    ///
    /// # Errors
    ///   When a directory cannot be created.
    pub fn prepare(&self) -> Result<(), PipelineError> {
        for dir in [&self.run_dir, &self.cubes_dir] {
            fs::create_dir_all(dir).map_err(|source| PipelineError::RunDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Removes the completions of an earlier cut.
    ///
    /// # Errors
    ///   When the results directory exists but cannot be removed.
    pub fn clear_results(&self) -> Result<(), PipelineError> {
        match fs::remove_dir_all(&self.results_dir) {
            Ok(()) => {
                info!("removed stale results in {}", self.results_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PipelineError::RunDir {
                path: self.results_dir.clone(),
                source,
            }),
        }
    }
}

/// Outcome of [`Pipeline::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Cube generation diagnostics.
    pub generation: GenerationReport,
    /// Completions found after inference.
    pub completions: usize,
    /// What was assembled.
    pub assembly: AssemblyReport,
}

/// load, cut, infer, assemble.
///
/// Stages run strictly one after another. Each can also be run on its own
/// against an existing [`RunContext`], e.g. to retry inference.
#[derive(Debug)]
pub struct Pipeline<E> {
    config: PipelineConfig,
    engine: E,
    cancel: CancelFlag,
}

impl<E: InferenceEngine> Pipeline<E> {
    /// Constructor
    ///
    /// # Errors
    ///   When the configuration is invalid.
    pub fn new(config: PipelineConfig, engine: E) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            cancel: CancelFlag::default(),
        })
    }

    /// The flag that aborts cube generation.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads `input` and writes its cells into the run.
    ///
    /// # Errors
    ///   When the input cannot be read or the cells cannot be written.
    pub fn cut(&self, input: &Path, ctx: &RunContext) -> Result<GenerationReport, PipelineError> {
        let cloud = load_cloud(input)?;
        info!("loaded {} points from {}", cloud.len(), input.display());
        self.cut_cloud(&cloud, ctx)
    }

    /// Writes the cells of an in-memory cloud into the run.
    ///
    /// Cells and completions left by an earlier cut in the same run are
    /// removed first.
    ///
    /// # Errors
    ///   When the cells cannot be written.
    pub fn cut_cloud(
        &self,
        cloud: &PointCloud,
        ctx: &RunContext,
    ) -> Result<GenerationReport, PipelineError> {
        ctx.prepare()?;
        ctx.clear_results()?;
        let generator =
            CubeGenerator::new(self.config.cubes.clone())?.with_cancel_flag(self.cancel.clone());
        Ok(generator.generate(cloud, &ctx.cubes_dir)?)
    }

    /// Runs the completion network over the run's cells.
    ///
    /// # Errors
    ///   When the engine fails. Cell files are left as they were.
    pub fn infer(&self, ctx: &RunContext) -> Result<CompletionManifest, PipelineError> {
        let manifest =
            self.engine
                .run_inference(&ctx.cubes_dir, &ctx.results_dir, &self.config.inference)?;
        match manifest.missing_from(&ctx.cubes_dir) {
            Ok(missing) if !missing.is_empty() => {
                warn!("{} cells have no completion", missing.len());
            }
            Ok(_) => {}
            Err(e) => warn!("could not list {}: {e}", ctx.cubes_dir.display()),
        }
        Ok(manifest)
    }

    /// Stitches the run's completions into `{out_dir}/{base}_completed*.ply`.
    ///
    /// # Errors
    ///   When the results cannot be listed or an output cannot be written.
    pub fn assemble(
        &self,
        ctx: &RunContext,
        out_dir: &Path,
        base: &str,
    ) -> Result<AssemblyReport, PipelineError> {
        let assembler = ResultAssembler::new(self.config.assembly.clone());
        Ok(assembler.assemble_dir(&ctx.results_dir, out_dir, base)?)
    }

    /// The whole chain. Outputs are named after the input's file stem.
    ///
    /// # Errors
    ///   The first stage error; later stages do not run.
    pub fn run(
        &self,
        input: &Path,
        ctx: &RunContext,
        out_dir: &Path,
    ) -> Result<RunSummary, PipelineError> {
        let base = base_name(input);
        info!("run {} for {base}", ctx.run_dir.display());

        let generation = self.cut(input, ctx)?;
        let manifest = self.infer(ctx)?;
        let assembler = ResultAssembler::new(self.config.assembly.clone());
        let assembly = assembler.assemble(&manifest, out_dir, &base)?;

        Ok(RunSummary {
            generation,
            completions: manifest.len(),
            assembly,
        })
    }
}

/// The file stem of `input`, used to name the outputs.
#[must_use]
pub fn base_name(input: &Path) -> String {
    input
        .file_stem()
        .map_or_else(|| "cloud".to_string(), |s| s.to_string_lossy().into_owned())
}
