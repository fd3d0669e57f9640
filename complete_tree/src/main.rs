#![deny(clippy::all)]
#![warn(clippy::cargo)]
#![warn(clippy::complexity)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::perf)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
//! Cut a tree point cloud into cubes, complete them with a neural network
//! and stitch the results.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use log::error;
use log::info;
use log::warn;
use tree_cubes::AssemblyReport;
use tree_cubes::MergeStrategy;
use tree_cubes::Pipeline;
use tree_cubes::PipelineConfig;
use tree_cubes::PipelineError;
use tree_cubes::RunContext;
use tree_cubes::SubprocessInference;
use tree_cubes::pipeline::base_name;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cut, complete and assemble in one go.
    Run {
        #[arg(long = "input", short = 'i', help = "point cloud file (.ply, .xyz, .txt, .pts)")]
        input: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long = "output", short = 'o', help = "directory for the assembled clouds, defaults to the run directory")]
        output: Option<PathBuf>,
    },
    /// Write the cube files only.
    Cut {
        #[arg(long = "input", short = 'i', help = "point cloud file (.ply, .xyz, .txt, .pts)")]
        input: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Complete the cubes of an existing run.
    Infer {
        #[arg(long = "run-dir", help = "run directory holding cubes/")]
        run_dir: PathBuf,
    },
    /// Stitch the completions of an existing run.
    Assemble {
        #[arg(long = "run-dir", help = "run directory holding inference_results/")]
        run_dir: PathBuf,
        #[arg(long = "base", short = 'b', help = "output name prefix")]
        base: String,
        #[arg(long = "output", short = 'o', help = "directory for the assembled clouds, defaults to the run directory")]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long = "run-dir", help = "reuse this run directory, replacing its cubes and results", conflicts_with = "base_dir")]
    run_dir: Option<PathBuf>,
    #[arg(long = "base-dir", help = "create a timestamped run directory here", default_value = ".")]
    base_dir: PathBuf,
}

impl RunArgs {
    fn context(&self) -> Result<RunContext, PipelineError> {
        match &self.run_dir {
            Some(run_dir) => Ok(RunContext::new(run_dir)),
            None => RunContext::timestamped(&self.base_dir),
        }
    }
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long = "config", short = 'c', global = true, help = "JSON pipeline configuration")]
    config: Option<PathBuf>,
    #[arg(long = "edge-lengths", global = true, value_delimiter = ',', help = "cube edge length per tier, e.g. 1.0,1.0,1.25,1.8")]
    edge_lengths: Vec<f64>,
    #[arg(long = "seed", global = true, help = "seed for downsampling")]
    seed: Option<u64>,
    #[arg(long = "no-augment", global = true, help = "do not write flipped duplicates")]
    no_augment: bool,
    #[arg(long = "combine-all", global = true, help = "also write main and flipped into one file")]
    combine_all: bool,
    #[arg(long = "streaming", global = true, help = "stream completions to disk while assembling")]
    streaming: bool,
    #[arg(long = "python", global = true, help = "python interpreter")]
    python: Option<String>,
    #[arg(long = "script", global = true, help = "inference script")]
    script: Option<PathBuf>,
    #[arg(long = "model-config", global = true, help = "network configuration file")]
    model_config: Option<PathBuf>,
    #[arg(long = "checkpoint", global = true, help = "trained weights")]
    checkpoint: Option<PathBuf>,
    #[arg(long = "device", global = true, help = "inference device, e.g. cuda:0 or cpu")]
    device: Option<String>,
    #[arg(long = "timeout", global = true, help = "kill inference after this many seconds")]
    timeout: Option<u64>,
}

impl Overrides {
    /// The configuration file, if any, with the flags applied on top.
    fn config(&self) -> Result<PipelineConfig, PipelineError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        config.cubes = config.cubes.with_edge_lengths(&self.edge_lengths);
        if let Some(seed) = self.seed {
            config.cubes = config.cubes.with_seed(seed);
        }
        if self.no_augment {
            config.cubes.augment = false;
        }
        if self.combine_all {
            config.assembly.combine_all = true;
        }
        if self.streaming {
            config.assembly.merge = MergeStrategy::Streaming;
        }
        let inference = &mut config.inference;
        if let Some(python) = &self.python {
            inference.python.clone_from(python);
        }
        if let Some(script) = &self.script {
            inference.script.clone_from(script);
        }
        if let Some(model_config) = &self.model_config {
            inference.model_config.clone_from(model_config);
        }
        if let Some(checkpoint) = &self.checkpoint {
            inference.checkpoint.clone_from(checkpoint);
        }
        if let Some(device) = &self.device {
            inference.device.clone_from(device);
        }
        if self.timeout.is_some() {
            inference.timeout_secs = self.timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

fn report_assembly(report: &AssemblyReport) -> ExitCode {
    for warning in &report.warnings {
        warn!("skipped {warning}");
    }
    if report.is_success() {
        info!(
            "assembled {} completions: {} main points, {} flipped points",
            report.processed, report.main_points, report.flipped_points
        );
        ExitCode::SUCCESS
    } else {
        error!("no usable completions");
        ExitCode::from(2)
    }
}

fn execute(cli: &Cli) -> Result<ExitCode, PipelineError> {
    let config = cli.overrides.config()?;
    let pipeline = Pipeline::new(config, SubprocessInference)?;

    let cancel = pipeline.cancel_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        if cancel.raise() {
            eprintln!("Received second Ctrl-C signal, exiting");
            std::process::exit(130);
        }
        eprintln!("Received Ctrl-C signal, cancelling (press again to exit)");
    }) {
        warn!("could not install the Ctrl-C handler: {e}");
    }

    match &cli.command {
        Command::Run { input, run, output } => {
            let ctx = run.context()?;
            let out_dir = output.as_deref().unwrap_or(&ctx.run_dir);
            let summary = pipeline.run(input, &ctx, out_dir)?;
            info!(
                "run {}: {} cubes, {} completions",
                ctx.run_dir.display(),
                summary.generation.cells_kept(),
                summary.completions
            );
            Ok(report_assembly(&summary.assembly))
        }
        Command::Cut { input, run } => {
            let ctx = run.context()?;
            let report = pipeline.cut(input, &ctx)?;
            info!(
                "{} cube files for {} in {}",
                report.files.len(),
                base_name(input),
                ctx.cubes_dir.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Infer { run_dir } => {
            let ctx = RunContext::new(run_dir);
            let manifest = pipeline.infer(&ctx)?;
            info!("{} completions", manifest.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Assemble {
            run_dir,
            base,
            output,
        } => {
            let ctx = RunContext::new(run_dir);
            let out_dir: &Path = output.as_deref().unwrap_or(&ctx.run_dir);
            let report = pipeline.assemble(&ctx, out_dir, base)?;
            Ok(report_assembly(&report))
        }
    }
}

fn main() -> ExitCode {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let cli = Cli::parse();
    match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Exception occurred: {e}");
            ExitCode::FAILURE
        }
    }
}
