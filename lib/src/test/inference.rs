use std::fs;
use std::path::Path;
use std::path::PathBuf;

use glam::DVec3;
use tempfile::tempdir;

use super::write_completion;
use crate::InferenceConfig;
use crate::InferenceError;
use crate::config::OutputFormats;
use crate::inference::COMPLETION_NPY;
use crate::inference::COMPLETION_XYZ;
use crate::inference::CompletionManifest;
use crate::inference::InferenceEngine;
use crate::inference::SubprocessInference;
use crate::inference::load_completion;
use crate::io::save_cell;
use crate::key::CellKey;

fn shell(dir: &Path, body: &str) -> InferenceConfig {
    let script = dir.join("infer.sh");
    fs::write(&script, body).unwrap();
    InferenceConfig {
        python: "sh".to_string(),
        script,
        ..Default::default()
    }
}

#[test]
fn command_line() {
    let config = InferenceConfig {
        device: "cpu".to_string(),
        formats: OutputFormats {
            npy: true,
            ply: false,
            xyz: true,
        },
        ..Default::default()
    };
    let command =
        SubprocessInference::command(Path::new("run/cubes"), Path::new("run/out"), &config);
    assert_eq!(command.get_program(), "python");
    let args: Vec<String> = command
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        args,
        [
            "tools/inference.py",
            "cfgs/predefhull_models/AdaPoinTr.yaml",
            "ckpts/AdaPoinTr_tree_grove_real.pth",
            "--pc_root",
            "run/cubes",
            "--out_pc_root",
            "run/out",
            "--device",
            "cpu",
            "--save_npy",
            "--save_xyz",
        ]
    );
}

#[cfg(unix)]
#[test]
fn successful_run_is_scanned() {
    let dir = tempdir().unwrap();
    let cells = dir.path().join("cubes");
    let out = dir.path().join("results");
    fs::create_dir_all(&cells).unwrap();
    let config = shell(
        dir.path(),
        "mkdir -p \"$6/cube_0_0_0_v1\" && printf '1 2 3\\n4 5 6\\n' > \"$6/cube_0_0_0_v1/fine.xyz\"\n",
    );

    let manifest = SubprocessInference
        .run_inference(&cells, &out, &config)
        .unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest.entries[0].key, CellKey::new(0, [0, 0, 0]));
    assert_eq!(
        load_completion(&manifest.entries[0].path).unwrap(),
        vec![DVec3::new(1.0, 2.0, 3.0), DVec3::new(4.0, 5.0, 6.0)]
    );
}

#[cfg(unix)]
#[test]
fn non_zero_exit() {
    let dir = tempdir().unwrap();
    let config = shell(dir.path(), "echo boom >&2\nexit 3\n");
    let result = SubprocessInference.run_inference(dir.path(), &dir.path().join("out"), &config);
    match result {
        Err(InferenceError::Failed { status, stderr }) => {
            assert_eq!(status.code(), Some(3));
            assert!(stderr.contains("boom"));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn timeout_kills_the_process() {
    let dir = tempdir().unwrap();
    let mut config = shell(dir.path(), "exec sleep 5\n");
    config.timeout_secs = Some(1);

    let start = std::time::Instant::now();
    let result = SubprocessInference.run_inference(dir.path(), &dir.path().join("out"), &config);
    assert!(matches!(result, Err(InferenceError::TimedOut(_))));
    assert!(start.elapsed().as_secs_f64() < 4.5);
}

#[test]
fn missing_interpreter() {
    let dir = tempdir().unwrap();
    let config = InferenceConfig {
        python: "/nonexistent/bin/python-does-not-exist".to_string(),
        ..Default::default()
    };
    let result = SubprocessInference.run_inference(dir.path(), &dir.path().join("out"), &config);
    assert!(matches!(result, Err(InferenceError::Spawn { .. })));
}

#[test]
fn scan_missing_directory() {
    let manifest = CompletionManifest::scan(Path::new("/nonexistent/results")).unwrap();
    assert!(manifest.is_empty());
    assert!(manifest.warnings.is_empty());
}

#[test]
fn scan_sorts_and_warns() {
    let dir = tempdir().unwrap();
    let results = dir.path();
    let b = CellKey::new(1, [0, 0, 0]);
    let a = CellKey::new(0, [2, 0, 0]).flipped();
    write_completion(results, &b, &[DVec3::ONE]);
    write_completion(results, &a, &[DVec3::ZERO]);

    // npy wins over xyz when both are present.
    fs::write(results.join(b.to_string()).join(COMPLETION_XYZ), "9 9 9\n").unwrap();
    // xyz alone is accepted.
    let c = CellKey::new(0, [0, 0, 1]);
    fs::create_dir_all(results.join(c.to_string())).unwrap();
    fs::write(results.join(c.to_string()).join(COMPLETION_XYZ), "1 1 1\n").unwrap();
    // Skipped with a warning.
    fs::create_dir_all(results.join("tensorboard")).unwrap();
    fs::create_dir_all(results.join("cube_5_5_5_v1")).unwrap();
    // Ignored.
    fs::write(results.join("log.txt"), "").unwrap();

    let manifest = CompletionManifest::scan(results).unwrap();
    let keys: Vec<CellKey> = manifest.entries.iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![c, a, b]);
    assert!(manifest.entries[2].path.ends_with(COMPLETION_NPY));
    assert!(manifest.entries[0].path.ends_with(COMPLETION_XYZ));

    let skipped: Vec<PathBuf> = manifest.warnings.iter().map(|w| w.path.clone()).collect();
    assert_eq!(
        skipped,
        vec![results.join("cube_5_5_5_v1"), results.join("tensorboard")]
    );
}

#[test]
fn missing_completions() {
    let dir = tempdir().unwrap();
    let cells = dir.path().join("cubes");
    let results = dir.path().join("results");
    fs::create_dir_all(&cells).unwrap();
    let done = CellKey::new(0, [0, 0, 0]);
    let pending = CellKey::new(0, [1, 0, 0]);
    for key in [done, pending, pending.flipped()] {
        save_cell(&cells.join(key.file_name()), &[DVec3::ZERO]).unwrap();
    }
    write_completion(&results, &done, &[DVec3::ZERO]);

    let manifest = CompletionManifest::scan(&results).unwrap();
    assert_eq!(
        manifest.missing_from(&cells).unwrap(),
        vec![pending, pending.flipped()]
    );
}
