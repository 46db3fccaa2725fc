//! Full pipeline run over two diagonal sources on a sparse composite.

use std::fs;
use std::path::{Path, PathBuf};

use cogchunk::{
    GeoTiffWriter, GeoTransform, Pipeline, PipelineConfig, RasterBuffer, RasterSource, SampleType,
};
use tempfile::TempDir;

const SIDE: usize = 2048;
const REGION: usize = 512;

/// A (top-left of the union) is all zero. B (bottom-right) carries a
/// 512x512 block of data in its own top-left corner.
fn write_inputs(dir: &Path) -> Vec<PathBuf> {
    let side = SIDE as f64;
    let a = dir.join("a.tif");
    GeoTiffWriter::new(SIDE, SIDE, 3, SampleType::U8, GeoTransform::north_up(0.0, 2.0 * side, 1.0, 1.0))
        .block_size(256)
        .epsg(Some(6539))
        .write_buffer(&a, &RasterBuffer::filled(SIDE, SIDE, 3, 0.0))
        .unwrap();

    let mut raster = RasterBuffer::filled(SIDE, SIDE, 3, 0.0);
    for y in 0..REGION {
        for x in 0..REGION {
            raster.pixel_mut(x, y).copy_from_slice(&[90.0, 120.0, 150.0]);
        }
    }
    let b = dir.join("b.tif");
    GeoTiffWriter::new(SIDE, SIDE, 3, SampleType::U8, GeoTransform::north_up(side, side, 1.0, 1.0))
        .block_size(256)
        .epsg(Some(6539))
        .write_buffer(&b, &raster)
        .unwrap();
    vec![a, b]
}

fn config(out: &Path) -> PipelineConfig {
    PipelineConfig::new(out)
        .with_chunk_size(1024)
        .with_probe_resolution(64)
        .with_block_size(256)
        .with_overview_count(2)
        .with_workers(2)
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_sparse_mosaic_yields_single_chunk() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_inputs(input.path());
    let site = out.path().join("site");
    let cfg = config(&site);

    let summary = Pipeline::new(cfg.clone()).run_directory(input.path()).unwrap();

    assert_eq!(summary.total, 16);
    assert_eq!(summary.encoded, 1);
    assert_eq!(summary.skipped_empty, 15);
    assert_eq!(summary.failed, 0);
    assert!(summary.skipped_sources.is_empty());
    assert_eq!(summary.outputs, vec![site.join("chunk_2048_2048.tif")]);

    // No manifest, no probe thumbnails, no temporaries
    assert_eq!(dir_names(&site), vec!["chunk_2048_2048.tif".to_string()]);

    let chunk = RasterSource::open(site.join("chunk_2048_2048.tif")).unwrap();
    assert_eq!((chunk.width, chunk.height, chunk.bands), (1024, 1024, 3));
    assert_eq!(chunk.epsg, Some(6539));
    assert_eq!(chunk.nodata, Some(0.0));
    assert_eq!(chunk.geo_transform.origin(), (2048.0, 2048.0));
}

#[test]
fn test_missing_directory_and_empty_directory() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let pipeline = Pipeline::new(config(&out.path().join("site")));

    assert!(matches!(
        pipeline.run_directory(input.path().join("missing")),
        Err(cogchunk::Error::Config(_))
    ));
    assert!(matches!(
        pipeline.run_directory(input.path()),
        Err(cogchunk::Error::MosaicBuild(msg)) if msg.starts_with("No files found")
    ));
}

#[test]
fn test_extension_filter_and_aligned_derivatives() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let inputs = write_inputs(input.path());
    // Other extensions are ignored
    fs::copy(&inputs[1], input.path().join("b.tiff")).unwrap();
    // Derivatives of earlier runs are never treated as inputs
    fs::write(input.path().join("a_aligned.tif"), b"not a tiff").unwrap();

    let site = out.path().join("site");
    let summary = Pipeline::new(config(&site)).run_directory(input.path()).unwrap();
    assert_eq!(summary.total, 16);
    assert_eq!(summary.encoded, 1);
    assert!(summary.skipped_sources.is_empty());
}

fn mtime_and_bytes(path: &Path) -> (std::time::SystemTime, Vec<u8>) {
    (fs::metadata(path).unwrap().modified().unwrap(), fs::read(path).unwrap())
}

#[test]
fn test_rotated_input_is_aligned_then_reused() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let rotated = input.path().join("rot.tif");
    let (s, c) = 30f64.to_radians().sin_cos();
    GeoTiffWriter::new(64, 64, 3, SampleType::U8, GeoTransform([1000.0, c, s, 2000.0, s, -c]))
        .block_size(32)
        .epsg(Some(6539))
        .write_buffer(&rotated, &RasterBuffer::filled(64, 64, 3, 120.0))
        .unwrap();

    let first_site = out.path().join("first");
    let cfg = PipelineConfig::new(&first_site)
        .with_chunk_size(32)
        .with_probe_resolution(16)
        .with_block_size(32)
        .with_overview_count(1);
    let first = Pipeline::new(cfg.clone()).run_directory(input.path()).unwrap();

    // Derivative sits beside the original and is axis-aligned
    let derivative_path = input.path().join("rot_aligned.tif");
    let derivative = RasterSource::open(&derivative_path).unwrap();
    assert!(!derivative.needs_normalization());
    let expected_side = (64.0 * (c + s)).ceil() as usize;
    assert_eq!((derivative.width, derivative.height), (expected_side, expected_side));

    // The chunk grid spans the derivative's footprint
    assert_eq!(first.total, expected_side.div_ceil(32).pow(2));
    assert_eq!(first.failed, 0);
    assert_eq!(first.encoded + first.skipped_empty, first.total);
    assert!(first.outputs.contains(&first_site.join("chunk_0_0.tif")));
    assert!(first.outputs.contains(&first_site.join("chunk_32_32.tif")));
    let corner = RasterSource::open(first_site.join("chunk_0_0.tif")).unwrap();
    let (cx, cy) = corner.geo_transform.origin();
    let (dx, dy) = derivative.geo_transform.origin();
    assert!((cx - dx).abs() < 1e-6 && (cy - dy).abs() < 1e-6);

    // Second run finds the derivative and leaves it untouched
    let before = mtime_and_bytes(&derivative_path);
    let second_site = out.path().join("second");
    let second = Pipeline::new(PipelineConfig { output_dir: second_site.clone(), ..cfg })
        .run_directory(input.path())
        .unwrap();
    assert_eq!(mtime_and_bytes(&derivative_path), before);
    assert_eq!(second.total, first.total);
    assert_eq!(second.encoded, first.encoded);
    assert_eq!(
        dir_names(input.path()),
        vec!["rot.tif".to_string(), "rot_aligned.tif".to_string()]
    );
}
