use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use glam::DVec3;

use tree_cubes::flip;

pub fn flip_cell(criterion: &mut Criterion) {
    let points: Vec<DVec3> = (0..8192)
        .map(|i| {
            let t = f64::from(i);
            DVec3::new(t, t * 0.5, -t)
        })
        .collect();

    criterion.bench_function("flip 8192 points", |b| {
        b.iter(|| {
            let flipped: Vec<DVec3> = black_box(&points).iter().copied().map(flip).collect();
            assert_eq!(flipped.len(), 8192);
        })
    });
}

criterion_group!(benches, flip_cell);
criterion_main!(benches);
