use std::fs;
use std::path::Path;

use glam::DVec3;
use tempfile::tempdir;

use super::write_completion;
use crate::AssemblyOptions;
use crate::MergeStrategy;
use crate::OutputKind;
use crate::ResultAssembler;
use crate::assemble::AssemblyReport;
use crate::inference::COMPLETION_NPY;
use crate::io::load_ply;
use crate::io::save_npy;
use crate::key::CellKey;

fn block(n: usize, base: f64) -> Vec<DVec3> {
    (0..n)
        .map(|i| {
            let i = i as f64;
            DVec3::new(base + i, base + 2.0 * i, base - i)
        })
        .collect()
}

/// Two unflipped and one flipped completion, 2048 points each, in single
/// tier directories.
fn scenario(results: &Path) -> (Vec<DVec3>, Vec<DVec3>, Vec<DVec3>) {
    let a = block(2048, 0.0);
    let a_flip = block(2048, 10_000.0);
    let b = block(2048, 50_000.0);
    for (name, points) in [("cube_0_0_0", &a), ("cube_0_0_0_flip", &a_flip), ("cube_1_0_0", &b)] {
        save_npy(&results.join(name).join(COMPLETION_NPY), points).unwrap();
    }
    (a, a_flip, b)
}

fn assemble(results: &Path, out: &Path, options: AssemblyOptions) -> AssemblyReport {
    ResultAssembler::new(options)
        .assemble_dir(results, out, "tree")
        .unwrap()
}

#[test]
fn output_names() {
    assert_eq!(OutputKind::Main.file_name("tree"), "tree_completed.ply");
    assert_eq!(
        OutputKind::Flipped.file_name("tree"),
        "tree_completed_withflips.ply"
    );
    assert_eq!(
        OutputKind::Combined.file_name("tree"),
        "tree_completed_combined.ply"
    );
}

#[test]
fn scenario_main_and_flipped() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    let out = dir.path().join("out");
    let (a, a_flip, b) = scenario(&results);

    let report = assemble(&results, &out, AssemblyOptions::default());
    assert!(report.is_success());
    assert_eq!(report.processed, 3);
    assert_eq!(report.main_points, 4096);
    assert_eq!(report.flipped_points, 2048);
    assert!(report.output(OutputKind::Combined).is_none());
    assert!(report.warnings.is_empty());

    let main = load_ply(&out.join("tree_completed.ply")).unwrap().into_points();
    let expected: Vec<DVec3> = a.iter().chain(&b).copied().collect();
    assert_eq!(main, expected);

    let flipped = load_ply(&out.join("tree_completed_withflips.ply"))
        .unwrap()
        .into_points();
    assert_eq!(flipped.len(), 2048);
    assert_eq!(flipped[5], DVec3::new(a_flip[5].z, a_flip[5].y, a_flip[5].x));
    assert!(flipped.iter().all(|p| !main.contains(p)));
}

#[test]
fn combined_is_main_then_flipped() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    let out = dir.path().join("out");
    scenario(&results);

    let options = AssemblyOptions {
        separate_flipped: false,
        combine_all: true,
        ..Default::default()
    };
    let report = assemble(&results, &out, options);
    assert_eq!(report.combined_points, 6144);
    assert!(out.join("tree_completed.ply").is_file());
    assert!(!out.join("tree_completed_withflips.ply").exists());

    let main = load_ply(&out.join("tree_completed.ply")).unwrap().into_points();
    let combined = load_ply(&out.join("tree_completed_combined.ply"))
        .unwrap()
        .into_points();
    assert_eq!(combined[..4096], main[..]);
}

#[test]
fn combined_needs_both_sides() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    let out = dir.path().join("out");
    write_completion(&results, &CellKey::new(0, [0, 0, 0]), &block(10, 0.0));

    let options = AssemblyOptions {
        combine_all: true,
        ..Default::default()
    };
    for merge in [MergeStrategy::InMemory, MergeStrategy::Streaming] {
        let report = assemble(&results, &out, AssemblyOptions { merge, ..options.clone() });
        assert_eq!(report.main_points, 10);
        assert_eq!(report.outputs.len(), 1);
        assert!(!out.join("tree_completed_combined.ply").exists());
        assert!(!out.join("tree_completed_withflips.ply").exists());
    }
}

#[test]
fn streaming_matches_in_memory() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    scenario(&results);
    write_completion(&results, &CellKey::new(2, [0, 1, 0]).flipped(), &block(7, -3.0));

    let options = |merge| AssemblyOptions {
        separate_flipped: true,
        combine_all: true,
        merge,
    };
    let memory = dir.path().join("memory");
    let streamed = dir.path().join("streamed");
    let a = assemble(&results, &memory, options(MergeStrategy::InMemory));
    let b = assemble(&results, &streamed, options(MergeStrategy::Streaming));

    assert_eq!(a.processed, b.processed);
    assert_eq!(a.main_points, b.main_points);
    assert_eq!(a.flipped_points, b.flipped_points);
    assert_eq!(a.combined_points, b.combined_points);
    for kind in [OutputKind::Main, OutputKind::Flipped, OutputKind::Combined] {
        let name = kind.file_name("tree");
        assert_eq!(
            fs::read(memory.join(&name)).unwrap(),
            fs::read(streamed.join(&name)).unwrap(),
            "{name}"
        );
    }
}

#[test]
fn unreadable_completions_are_skipped() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    let out = dir.path().join("out");
    write_completion(&results, &CellKey::new(0, [0, 0, 0]), &block(4, 0.0));
    let broken = results.join("cube_0_1_0_v1");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("fine.npy"), b"garbage").unwrap();
    fs::create_dir_all(results.join("not_a_cube")).unwrap();

    for merge in [MergeStrategy::InMemory, MergeStrategy::Streaming] {
        let options = AssemblyOptions {
            merge,
            ..Default::default()
        };
        let report = assemble(&results, &out, options);
        assert!(report.is_success());
        assert_eq!(report.processed, 1);
        assert_eq!(report.main_points, 4);
        assert_eq!(report.warnings.len(), 2);
    }
}

#[test]
fn scenario_nothing_to_assemble() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results");
    let out = dir.path().join("out");
    fs::create_dir_all(results.join("checkpoints")).unwrap();
    fs::create_dir_all(results.join("cube_0_0_0_v1")).unwrap();

    for merge in [MergeStrategy::InMemory, MergeStrategy::Streaming] {
        let options = AssemblyOptions {
            merge,
            combine_all: true,
            ..Default::default()
        };
        let report = assemble(&results, &out, options);
        assert!(!report.is_success());
        assert!(report.outputs.is_empty());
        assert_eq!(report.warnings.len(), 2);
        assert!(!out.exists() || fs::read_dir(&out).unwrap().count() == 0);
    }
}

#[test]
fn missing_results_directory() {
    let dir = tempdir().unwrap();
    let report = assemble(
        &dir.path().join("absent"),
        &dir.path().join("out"),
        AssemblyOptions::default(),
    );
    assert!(!report.is_success());
    assert!(!dir.path().join("out").exists());
}
