//! Geo index benchmarks
//!
//! Measures radius and bounding-box query latency over a city-sized grid of
//! spots at several cell sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spot_engine::geo::GeoIndex;
use spot_engine::{BoundingBox, GeoPoint, SpotId};

const CENTER: (f64, f64) = (52.52, 13.405);

/// Lay `count` spots on a square grid `spread_deg` wide around the center
fn build_index(count: usize, spread_deg: f64, cell_size_deg: f64) -> GeoIndex {
    let index = GeoIndex::new(cell_size_deg);
    let side = (count as f64).sqrt().ceil() as usize;
    let step = spread_deg / side as f64;

    for i in 0..count {
        let lat = CENTER.0 - spread_deg / 2.0 + (i / side) as f64 * step;
        let lon = CENTER.1 - spread_deg / 2.0 + (i % side) as f64 * step;
        index
            .insert(SpotId::new(format!("S{}", i)), GeoPoint::new(lat, lon))
            .unwrap();
    }

    index
}

fn bench_radius_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("radius_query");
    let center = GeoPoint::new(CENTER.0, CENTER.1);

    for count in [1_000usize, 10_000, 50_000] {
        let index = build_index(count, 0.2, 0.005);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("500m_limit_20", count), &index, |b, index| {
            b.iter(|| index.query(black_box(&center), black_box(500.0), Some(20)).unwrap())
        });
    }

    group.finish();
}

fn bench_cell_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("cell_size");
    let center = GeoPoint::new(CENTER.0, CENTER.1);

    for cell_size_deg in [0.001f64, 0.005, 0.02] {
        let index = build_index(10_000, 0.2, cell_size_deg);
        group.bench_with_input(
            BenchmarkId::from_parameter(cell_size_deg),
            &index,
            |b, index| b.iter(|| index.query(black_box(&center), 1_000.0, None).unwrap()),
        );
    }

    group.finish();
}

fn bench_bounding_box(c: &mut Criterion) {
    let index = build_index(10_000, 0.2, 0.005);
    let bounds = BoundingBox::new(52.50, 13.38, 52.54, 13.43);

    c.bench_function("bounding_box_10k", |b| {
        b.iter(|| index.query_bounding_box(black_box(&bounds)).unwrap())
    });
}

criterion_group!(benches, bench_radius_query, bench_cell_size, bench_bounding_box);
criterion_main!(benches);
