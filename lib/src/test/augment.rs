use std::fs;

use glam::DVec3;
use tempfile::tempdir;

use super::uniform_cloud;
use crate::CancelFlag;
use crate::CubeConfig;
use crate::CubeGenerator;
use crate::GenerateError;
use crate::TierConfig;
use crate::augment::FLIP_PERMUTATION;
use crate::augment::expand;
use crate::augment::expand_dir;
use crate::augment::flip;
use crate::augment::unflip;
use crate::io::load_cell;
use crate::io::save_cell;
use crate::key::CellKey;

#[test]
fn flip_swaps_x_and_z() {
    let p = DVec3::new(1.0, 2.0, 3.0);
    assert_eq!(flip(p), DVec3::new(3.0, 2.0, 1.0));
    assert_eq!(unflip(flip(p)), p);
    assert_eq!(flip(flip(p)), p);
    assert_eq!(FLIP_PERMUTATION.map(|a| p[a]), flip(p).to_array());
}

#[test]
fn flip_is_an_exact_involution() {
    let cloud = uniform_cloud(1_000, -1e6, 2e6, 10);
    for p in cloud.points() {
        assert_eq!(flip(flip(*p)).to_array().map(f64::to_bits), p.to_array().map(f64::to_bits));
    }
}

#[test]
fn expand_is_one_to_one() {
    let cloud = uniform_cloud(2_000, 0.0, 2.0, 11);
    let config = CubeConfig::single_tier(TierConfig::new(1.0, [0.0; 3]));
    let (cells, _) = CubeGenerator::new(config).unwrap().cut(&cloud).unwrap();

    let augmented = expand(&cells);
    assert_eq!(augmented.len(), cells.len());
    for (cell, flipped) in cells.iter().zip(&augmented) {
        assert!(flipped.is_flipped);
        assert_eq!(flipped.key, cell.key.flipped());
        assert_eq!(flipped.permutation(), [2, 1, 0]);
        assert_eq!(flipped.points.len(), cell.cloud.len());
        assert_eq!(flipped.points[0], flip(cell.points()[0]));
    }
}

#[test]
fn expand_dir_writes_flipped_duplicates() {
    let dir = tempdir().unwrap();
    let a = CellKey::new(0, [0, 0, 0]);
    let b = CellKey::new(2, [1, 3, 2]);
    save_cell(&dir.path().join(a.file_name()), &[DVec3::new(1.0, 2.0, 3.0)]).unwrap();
    save_cell(
        &dir.path().join(b.file_name()),
        &[DVec3::new(-1.0, 0.0, 0.5), DVec3::new(4.0, 5.0, 6.0)],
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "not a cell").unwrap();
    fs::write(dir.path().join("cube_0_0_0_v1.csv"), "ignored").unwrap();

    let written = expand_dir(dir.path(), &CancelFlag::new()).unwrap();
    assert_eq!(written, 2);

    let flipped = load_cell(&dir.path().join(b.flipped().file_name())).unwrap();
    assert_eq!(
        flipped,
        vec![DVec3::new(0.5, 0.0, -1.0), DVec3::new(6.0, 5.0, 4.0)]
    );
    assert!(dir.path().join("cube_0_0_0_v1_flip.txt").is_file());

    // Running again only flips the originals.
    assert_eq!(expand_dir(dir.path(), &CancelFlag::new()).unwrap(), 2);
    assert!(!dir.path().join("cube_0_0_0_v1_flip_flip.txt").exists());
}

#[test]
fn expand_dir_propagates_bad_cells() {
    let dir = tempdir().unwrap();
    save_cell(&dir.path().join("cube_0_0_0_v1.txt"), &[DVec3::ONE]).unwrap();
    fs::write(dir.path().join("cube_0_0_1_v1.txt"), "1 2\n").unwrap();

    let result = expand_dir(dir.path(), &CancelFlag::new());
    assert!(matches!(result, Err(GenerateError::Read(_))));
    assert!(!dir.path().join("cube_0_0_0_v1_flip.txt").exists());
}
