// Consensus scoring benchmarks for the triad matrix.
//
// Covers neighbor discovery and full score computation as the matrix grows.
// Scoring rescans every triad on each call, so cost is linear in matrix size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use triad_protocol::matrix::{consensus_score, find_connections, Position, Triad};

/// Builds `n` triads spread over a cube of edge `dimensions`, every other
/// one validated.
fn populate(n: usize, dimensions: u32) -> Vec<Triad> {
    (0..n)
        .map(|i| {
            let k = i as u32;
            Triad {
                id: format!("{i:032x}"),
                data: json!({ "seq": i }),
                validator: "TRDbench".to_string(),
                timestamp: i as u64,
                position: Position::new(
                    k % dimensions,
                    (k / dimensions) % dimensions,
                    (k / (dimensions * dimensions)) % dimensions,
                ),
                validated: i % 2 == 0,
                consensus: 0.0,
                validation_attempts: 0,
            }
        })
        .collect()
}

fn bench_find_connections(c: &mut Criterion) {
    let triads = populate(1_000, 10);
    let target = triads[0].clone();

    c.bench_function("consensus/find_connections_1k", |b| {
        b.iter(|| find_connections(black_box(&target), black_box(&triads), 4));
    });
}

fn bench_consensus_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("consensus/score");

    for matrix_size in [10usize, 100, 1_000, 10_000] {
        let triads = populate(matrix_size, 22);
        let target = triads[matrix_size / 2].clone();

        group.throughput(Throughput::Elements(matrix_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(matrix_size),
            &triads,
            |b, triads| {
                b.iter(|| consensus_score(black_box(&target), black_box(triads), 4, true));
            },
        );
    }

    group.finish();
}

fn bench_default_matrix(c: &mut Criterion) {
    // The default 3x3x3 cube saturates quickly; measure a full one.
    let triads = populate(27, 3);
    let target = triads[13].clone();

    c.bench_function("consensus/default_cube", |b| {
        b.iter(|| consensus_score(black_box(&target), black_box(&triads), 4, false));
    });
}

criterion_group!(
    benches,
    bench_find_connections,
    bench_consensus_score,
    bench_default_matrix,
);
criterion_main!(benches);
