//! Benchmarks for the per-window hot paths.
//!
//! Run with: `cargo bench`
//!
//! - Chunk grid planning over large extents
//! - Emptiness probing of a window at several thumbnail resolutions
//! - Composite region reads

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use cogchunk::{
    build, plan, probe, ChunkWindow, Composite, GeoTiffWriter, GeoTransform, RasterBuffer,
    RasterSource, RegionSource, ResamplingMethod, SampleType,
};
use cogchunk::resample::Region;
use tempfile::TempDir;

fn bench_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");

    for (width, chunk) in [(100_000, 65536), (400_000, 16384), (400_000, 1024)] {
        group.bench_with_input(
            BenchmarkId::new(format!("{width}px"), chunk),
            &(width, chunk),
            |b, &(w, c)| {
                b.iter(|| plan(black_box(w), black_box(w), black_box(c)).count());
            },
        );
    }

    group.finish();
}

/// 1024x1024 RGB composite with data in one quadrant.
fn composite(dir: &TempDir) -> Composite {
    let mut raster = RasterBuffer::filled(1024, 1024, 3, 0.0);
    for y in 512..1024 {
        for x in 512..1024 {
            raster.pixel_mut(x, y).copy_from_slice(&[40.0, 80.0, 120.0]);
        }
    }
    let path = dir.path().join("bench.tif");
    GeoTiffWriter::new(1024, 1024, 3, SampleType::U8, GeoTransform::north_up(0.0, 1024.0, 1.0, 1.0))
        .block_size(256)
        .write_buffer(&path, &raster)
        .expect("write bench input");
    let source = RasterSource::open(&path).expect("open bench input");
    build(&[source], &dir.path().join("output.vrt"), 0.0).expect("build bench mosaic")
}

fn bench_probe(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let composite = composite(&dir);
    let scratch = TempDir::new().expect("scratch dir");

    let mut group = c.benchmark_group("probe");
    group.sample_size(20);

    for resolution in [32, 128, 512] {
        group.bench_with_input(BenchmarkId::new("empty", resolution), &resolution, |b, &res| {
            b.iter(|| probe(&composite, ChunkWindow::new(0, 0, 512, 512), res, 0.0, scratch.path()));
        });
        group.bench_with_input(BenchmarkId::new("data", resolution), &resolution, |b, &res| {
            b.iter(|| probe(&composite, ChunkWindow::new(512, 512, 512, 512), res, 0.0, scratch.path()));
        });
    }

    group.finish();
}

fn bench_region_read(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let composite = composite(&dir);

    let mut group = c.benchmark_group("region_read");
    group.sample_size(20);

    for method in [ResamplingMethod::Nearest, ResamplingMethod::Bilinear, ResamplingMethod::Average] {
        group.bench_with_input(BenchmarkId::new("1024_to_256", method), &method, |b, &m| {
            b.iter(|| composite.read_region(Region::new(0.0, 0.0, 1024.0, 1024.0), 256, 256, black_box(m)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_planning, bench_probe, bench_region_read);
criterion_main!(benches);
