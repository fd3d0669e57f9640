use std::fs;
use std::path::Path;
use std::path::PathBuf;

use glam::DVec3;
use log::info;
use log::warn;
use rayon::prelude::*;

use crate::augment::unflip;
use crate::config::AssemblyOptions;
use crate::config::MergeStrategy;
use crate::error::AssemblyError;
use crate::error::PartialResultWarning;
use crate::inference::CompletionEntry;
use crate::inference::CompletionManifest;
use crate::inference::load_completion;
use crate::io::PlyStreamWriter;
use crate::io::save_points;

/// Suffix of the stacked unflipped completions.
pub const MAIN_SUFFIX: &str = "_completed";

/// Suffix of the stacked flipped completions, restored to the original axes.
pub const FLIPPED_SUFFIX: &str = "_completed_withflips";

/// Suffix of main followed by flipped.
pub const COMBINED_SUFFIX: &str = "_completed_combined";

/// The assembled clouds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputKind {
    /// Unflipped completions.
    Main,
    /// Flipped completions, un-flipped.
    Flipped,
    /// Main followed by flipped.
    Combined,
}

impl OutputKind {
    /// `{base}_completed.ply` and friends.
    #[must_use]
    pub fn file_name(self, base: &str) -> String {
        let suffix = match self {
            Self::Main => MAIN_SUFFIX,
            Self::Flipped => FLIPPED_SUFFIX,
            Self::Combined => COMBINED_SUFFIX,
        };
        format!("{base}{suffix}.ply")
    }
}

/// What the assembler did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Completions loaded and stacked.
    pub processed: usize,
    /// Points in the main output.
    pub main_points: usize,
    /// Points from flipped completions.
    pub flipped_points: usize,
    /// Points in the combined output, 0 when none was written.
    pub combined_points: usize,
    /// Files written.
    pub outputs: Vec<(OutputKind, PathBuf)>,
    /// Completions that were skipped.
    pub warnings: Vec<PartialResultWarning>,
}

impl AssemblyReport {
    /// False when there was nothing to assemble.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.processed > 0
    }

    /// The file written for `kind`, if any.
    #[must_use]
    pub fn output(&self, kind: OutputKind) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| p.as_path())
    }
}

/// Un-flips and stacks per cell completions into one to three clouds.
#[derive(Clone, Debug, Default)]
pub struct ResultAssembler {
    options: AssemblyOptions,
}

impl ResultAssembler {
    /// Constructor
    #[must_use]
    pub const fn new(options: AssemblyOptions) -> Self {
        Self { options }
    }

    /// Scans `results_dir` then assembles what it finds.
    ///
    /// # Errors
    ///   When the directory cannot be listed or an output cannot be written.
    pub fn assemble_dir(
        &self,
        results_dir: &Path,
        out_dir: &Path,
        base: &str,
    ) -> Result<AssemblyReport, AssemblyError> {
        let manifest =
            CompletionManifest::scan(results_dir).map_err(|source| AssemblyError::Scan {
                path: results_dir.to_path_buf(),
                source,
            })?;
        self.assemble(&manifest, out_dir, base)
    }

    /// Writes the outputs named after `base` into `out_dir`.
    ///
    /// Unreadable completions are skipped with a warning. With nothing
    /// usable, no file is written and the report is not a success.
    ///
    /// # Errors
    ///   When an output cannot be written.
    pub fn assemble(
        &self,
        manifest: &CompletionManifest,
        out_dir: &Path,
        base: &str,
    ) -> Result<AssemblyReport, AssemblyError> {
        let mut report = AssemblyReport {
            warnings: manifest.warnings.clone(),
            ..Default::default()
        };
        let (main, flipped): (Vec<&CompletionEntry>, Vec<&CompletionEntry>) =
            manifest.entries.iter().partition(|e| !e.key.flipped);
        info!(
            "assembling {} completions ({} flipped)",
            manifest.len(),
            flipped.len()
        );

        match self.options.merge {
            MergeStrategy::InMemory => {
                self.merge_in_memory(&main, &flipped, out_dir, base, &mut report)?;
            }
            MergeStrategy::Streaming => {
                self.merge_streaming(&main, &flipped, out_dir, base, &mut report)?;
            }
        }

        if report.is_success() {
            for (kind, path) in &report.outputs {
                info!("{kind:?} output: {}", path.display());
            }
        } else {
            warn!("no usable completions, nothing assembled");
        }
        Ok(report)
    }

    fn merge_in_memory(
        &self,
        main: &[&CompletionEntry],
        flipped: &[&CompletionEntry],
        out_dir: &Path,
        base: &str,
        report: &mut AssemblyReport,
    ) -> Result<(), AssemblyError> {
        let main = stack(load_all(main, report), false);
        let flipped = stack(load_all(flipped, report), true);
        if report.processed == 0 {
            return Ok(());
        }
        report.main_points = main.len();
        report.flipped_points = flipped.len();

        let mut write = |kind: OutputKind, points: &[DVec3]| {
            let path = out_dir.join(kind.file_name(base));
            save_points(&path, points).map_err(|source| AssemblyError::Write {
                path: path.clone(),
                source,
            })?;
            report.outputs.push((kind, path));
            Ok::<(), AssemblyError>(())
        };

        if !main.is_empty() {
            write(OutputKind::Main, &main)?;
        }
        if self.options.separate_flipped && !flipped.is_empty() {
            write(OutputKind::Flipped, &flipped)?;
        }
        if self.options.combine_all && !main.is_empty() && !flipped.is_empty() {
            let mut combined = main;
            combined.extend(flipped);
            write(OutputKind::Combined, &combined)?;
            report.combined_points = combined.len();
        }
        Ok(())
    }

    fn merge_streaming(
        &self,
        main: &[&CompletionEntry],
        flipped: &[&CompletionEntry],
        out_dir: &Path,
        base: &str,
        report: &mut AssemblyReport,
    ) -> Result<(), AssemblyError> {
        if main.is_empty() && flipped.is_empty() {
            return Ok(());
        }
        let mut streams = Streams::create(&self.options, out_dir, base)?;

        for (entries, is_flipped) in [(main, false), (flipped, true)] {
            for entry in entries {
                let Some(mut points) = load_one(entry, report) else {
                    continue;
                };
                if is_flipped {
                    points.iter_mut().for_each(|p| *p = unflip(*p));
                    report.flipped_points += points.len();
                } else {
                    report.main_points += points.len();
                }
                report.processed += 1;
                if let Err(e) = streams.push(&points, is_flipped) {
                    streams.abandon();
                    return Err(e);
                }
            }
        }

        streams.finish(report)
    }
}

fn load_one(entry: &CompletionEntry, report: &mut AssemblyReport) -> Option<Vec<DVec3>> {
    match load_completion(&entry.path) {
        Ok(points) => Some(points),
        Err(e) => {
            warn!("skipping {}: {e}", entry.key);
            report.warnings.push(PartialResultWarning {
                path: entry.path.clone(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Loads in parallel, keeping key order. Failures become warnings.
fn load_all(entries: &[&CompletionEntry], report: &mut AssemblyReport) -> Vec<Vec<DVec3>> {
    let loaded: Vec<_> = entries
        .par_iter()
        .map(|entry| (*entry, load_completion(&entry.path)))
        .collect();
    let mut blocks = Vec::with_capacity(loaded.len());
    for (entry, result) in loaded {
        match result {
            Ok(points) => {
                report.processed += 1;
                blocks.push(points);
            }
            Err(e) => {
                warn!("skipping {}: {e}", entry.key);
                report.warnings.push(PartialResultWarning {
                    path: entry.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    blocks
}

fn stack(blocks: Vec<Vec<DVec3>>, unflip_points: bool) -> Vec<DVec3> {
    let mut stacked = Vec::with_capacity(blocks.iter().map(Vec::len).sum());
    for block in blocks {
        if unflip_points {
            stacked.extend(block.into_iter().map(unflip));
        } else {
            stacked.extend(block);
        }
    }
    stacked
}

/// The open output files of a streaming merge.
struct Streams {
    main: PlyStreamWriter,
    flipped: Option<PlyStreamWriter>,
    combined: Option<PlyStreamWriter>,
}

impl Streams {
    fn create(options: &AssemblyOptions, out_dir: &Path, base: &str) -> Result<Self, AssemblyError> {
        let open = |kind: OutputKind| {
            let path = out_dir.join(kind.file_name(base));
            PlyStreamWriter::create(&path).map_err(|source| AssemblyError::Write { path, source })
        };
        let mut streams = Self {
            main: open(OutputKind::Main)?,
            flipped: None,
            combined: None,
        };
        for (enabled, kind) in [
            (options.separate_flipped, OutputKind::Flipped),
            (options.combine_all, OutputKind::Combined),
        ] {
            if !enabled {
                continue;
            }
            match open(kind) {
                Ok(writer) if kind == OutputKind::Flipped => streams.flipped = Some(writer),
                Ok(writer) => streams.combined = Some(writer),
                Err(e) => {
                    streams.abandon();
                    return Err(e);
                }
            }
        }
        Ok(streams)
    }

    fn push(&mut self, points: &[DVec3], is_flipped: bool) -> Result<(), AssemblyError> {
        let target = if is_flipped {
            self.flipped.as_mut()
        } else {
            Some(&mut self.main)
        };
        for writer in target.into_iter().chain(self.combined.as_mut()) {
            writer.push(points).map_err(|source| AssemblyError::Write {
                path: writer.path().to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    fn abandon(self) {
        let paths = [Some(self.main.path().to_path_buf())]
            .into_iter()
            .chain([
                self.flipped.as_ref().map(|w| w.path().to_path_buf()),
                self.combined.as_ref().map(|w| w.path().to_path_buf()),
            ])
            .flatten()
            .collect::<Vec<_>>();
        drop(self);
        for path in paths {
            let _ = fs::remove_file(path);
        }
    }

    /// Closes every file, removing the ones that ended up empty.
    fn finish(self, report: &mut AssemblyReport) -> Result<(), AssemblyError> {
        let both_sides = report.main_points > 0 && report.flipped_points > 0;
        let outputs = [
            (OutputKind::Main, Some(self.main), report.main_points > 0),
            (
                OutputKind::Flipped,
                self.flipped,
                report.flipped_points > 0,
            ),
            (OutputKind::Combined, self.combined, both_sides),
        ];
        for (kind, writer, keep) in outputs {
            let Some(writer) = writer else {
                continue;
            };
            let path = writer.path().to_path_buf();
            let count = writer.finish().map_err(|source| AssemblyError::Write {
                path: path.clone(),
                source,
            })?;
            if keep && report.processed > 0 {
                if kind == OutputKind::Combined {
                    report.combined_points = usize::try_from(count).unwrap_or(usize::MAX);
                }
                report.outputs.push((kind, path));
            } else if let Err(e) = fs::remove_file(&path) {
                warn!("could not remove empty {}: {e}", path.display());
            }
        }
        Ok(())
    }
}
