//! End-to-end orchestration of a chunking run.
//!
//! ```text
//! inputs ─► normalize ─► mosaic manifest ─► plan ─► executor {probe ─► skip | encode}
//!                              │                                   │
//!                              └──────── removed on drop ◄─────────┘
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::encode::{encode, EncodeParams};
use crate::error::{Error, Result};
use crate::executor::{ChunkWorker, Executor, JobFailure, JobOutcome};
use crate::mosaic::{self, Composite};
use crate::normalize::{normalize, NormalizeOptions};
use crate::plan::{plan, ChunkWindow};
use crate::probe::probe;
use crate::raster::RasterSource;
use crate::source::{LocalInputSource, LocalScanOptions};

/// Outcome of a [`Pipeline`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Windows in the plan
    pub total: usize,
    pub encoded: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    /// Written chunk files, sorted by path
    pub outputs: Vec<PathBuf>,
    /// Inputs that could not be opened or normalized
    pub skipped_sources: Vec<PathBuf>,
    pub failures: Vec<JobFailure>,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// One window's unit of work.
#[derive(Debug, Clone)]
pub struct ChunkJob<'a> {
    pub window: ChunkWindow,
    pub output_path: PathBuf,
    pub params: &'a EncodeParams,
}

impl ChunkJob<'_> {
    /// Probe the window and encode it unless it is empty.
    ///
    /// # Errors
    /// Returns [`Error::Probe`] or [`Error::ChunkEncode`] for this window.
    pub fn run(&self, composite: &Composite, probe_resolution: usize, scratch_dir: &Path) -> Result<JobOutcome> {
        let verdict = probe(composite, self.window, probe_resolution, self.params.nodata, scratch_dir)?;
        if verdict.empty {
            info!(
                "Skipped empty chunk at position ({}, {})",
                self.window.x_offset, self.window.y_offset
            );
            return Ok(JobOutcome::SkippedEmpty);
        }
        debug!(window = %self.window, "Starting chunk encode");
        let chunk = encode(composite, self.window, &self.output_path, self.params)?;
        info!("Created chunk: {}", chunk.path.display());
        Ok(JobOutcome::Encoded(chunk))
    }
}

/// Worker context: a private composite opened from the manifest.
struct ChunkJobWorker<'a> {
    composite: Composite,
    config: &'a PipelineConfig,
}

impl<'a> ChunkJobWorker<'a> {
    fn open(manifest: &Path, config: &'a PipelineConfig) -> Result<Self> {
        Ok(Self {
            composite: Composite::open_with_cache(manifest, config.cache_bytes)?,
            config,
        })
    }
}

impl ChunkWorker for ChunkJobWorker<'_> {
    fn process(&mut self, window: ChunkWindow) -> Result<JobOutcome> {
        ChunkJob {
            window,
            output_path: window.output_path(&self.config.output_dir),
            params: &self.config.encode,
        }
        .run(&self.composite, self.config.probe_resolution, self.config.scratch_dir())
    }
}

/// Deletes the manifest when dropped, on every exit path.
struct ManifestGuard {
    path: PathBuf,
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed mosaic manifest"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove mosaic manifest"),
        }
    }
}

/// The chunking pipeline.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Discover inputs in `input_dir` and run on them.
    ///
    /// # Errors
    /// See [`Pipeline::run`]; also [`Error::Config`] if `input_dir` is missing.
    pub fn run_directory<P: AsRef<Path>>(&self, input_dir: P) -> Result<RunSummary> {
        let input_dir = input_dir.as_ref();
        let source = LocalInputSource::scan(input_dir, &LocalScanOptions::with_extension(&self.config.extension))?;
        let stats = source.stats();
        info!(
            dir = %input_dir.display(),
            files = stats.file_count,
            size_mb = stats.total_size_mb(),
            "Scanned input directory"
        );
        if source.is_empty() {
            return Err(Error::MosaicBuild(format!(
                "No files found in the directory: {}",
                input_dir.display()
            )));
        }
        let inputs: Vec<PathBuf> = source.entries().iter().map(|e| e.path.clone()).collect();
        self.run(&inputs)
    }

    /// Run the pipeline on an explicit list of input rasters.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid configuration,
    /// [`Error::MosaicBuild`] when no usable input remains, and
    /// [`Error::Io`]/[`Error::Manifest`] if the output directory or manifest
    /// cannot be written. Per-window failures are reported in the summary.
    pub fn run(&self, inputs: &[PathBuf]) -> Result<RunSummary> {
        let config = &self.config;
        config.validate()?;
        if inputs.is_empty() {
            return Err(Error::MosaicBuild("no input files".to_string()));
        }

        let normalize_options = NormalizeOptions {
            resampling: config.encode.resampling,
            nodata: config.encode.nodata,
            block_size: config.encode.block_size,
        };
        let mut summary = RunSummary::default();
        let mut sources = Vec::with_capacity(inputs.len());
        for path in inputs {
            match RasterSource::open(path).and_then(|src| normalize(&src, &normalize_options)) {
                Ok(src) => sources.push(src),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable source");
                    summary.skipped_sources.push(path.clone());
                }
            }
        }
        if sources.is_empty() {
            return Err(Error::MosaicBuild("none of the input files could be opened".to_string()));
        }

        fs::create_dir_all(&config.output_dir)?;
        if let Some(scratch) = &config.scratch_dir {
            fs::create_dir_all(scratch)?;
        }

        let manifest = config.manifest_path();
        let guard = ManifestGuard { path: manifest.clone() };
        info!("Creating mosaic with {} files...", sources.len());
        let composite = mosaic::build(&sources, &manifest, config.encode.nodata)?;
        match composite.bounds_wgs84() {
            Ok(Some(b)) => info!(
                minx = b.minx,
                miny = b.miny,
                maxx = b.maxx,
                maxy = b.maxy,
                "Mosaic footprint (WGS84)"
            ),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Mosaic footprint unavailable"),
        }

        let (width, height) = (composite.width(), composite.height());

        let chunk_plan = plan(width, height, config.chunk_size);
        info!(
            "Processing mosaic of size {width}x{height} into chunks of size {0}x{0}...",
            config.chunk_size
        );
        info!("Need to process {} chunks", chunk_plan.len());

        let report = Executor::new(config.workers).run(
            chunk_plan,
            |_| ChunkJobWorker::open(&manifest, config),
            |_| {},
        )?;
        drop(guard);

        let mut outputs: Vec<PathBuf> = report.encoded.iter().map(|c| c.path.clone()).collect();
        outputs.sort();
        summary.total = report.total;
        summary.encoded = report.encoded.len();
        summary.skipped_empty = report.skipped_empty;
        summary.failed = report.failures.len();
        summary.outputs = outputs;
        summary.failures = report.failures;

        info!(
            "Processing complete. Non-empty chunks saved in {}.",
            config.output_dir.display()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoTransform;
    use crate::geotiff_writer::GeoTiffWriter;
    use crate::raster::{RasterBuffer, SampleType};
    use tempfile::TempDir;

    fn write_input(dir: &Path, name: &str, value: f32) -> PathBuf {
        let path = dir.join(name);
        GeoTiffWriter::new(64, 64, 3, SampleType::U8, GeoTransform::north_up(0.0, 64.0, 1.0, 1.0))
            .block_size(32)
            .write_buffer(&path, &RasterBuffer::filled(64, 64, 3, value))
            .unwrap();
        path
    }

    fn config(out: &Path) -> PipelineConfig {
        PipelineConfig::new(out)
            .with_chunk_size(32)
            .with_probe_resolution(8)
            .with_block_size(16)
            .with_overview_count(2)
    }

    #[test]
    fn test_run_removes_manifest_and_counts_windows() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = write_input(input.path(), "a.tif", 50.0);
        let cfg = config(&out.path().join("site"));

        let summary = Pipeline::new(cfg.clone()).run(&[path]).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.encoded, 4);
        assert!(summary.is_success());
        assert!(!cfg.manifest_path().exists());
        assert_eq!(summary.outputs[0], cfg.output_dir.join("chunk_0_0.tif"));
    }

    #[test]
    fn test_unreadable_sources_are_skipped() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let good = write_input(input.path(), "a.tif", 0.0);
        let bad = input.path().join("bad.tif");
        fs::write(&bad, b"garbage").unwrap();

        let summary = Pipeline::new(config(out.path())).run(&[bad.clone(), good]).unwrap();
        assert_eq!(summary.skipped_sources, vec![bad]);
        assert_eq!(summary.skipped_empty, 4);
        assert!(summary.outputs.is_empty());
    }

    #[test]
    fn test_no_usable_inputs_is_mosaic_error() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let bad = input.path().join("bad.tif");
        fs::write(&bad, b"garbage").unwrap();

        let pipeline = Pipeline::new(config(&out.path().join("site")));
        assert!(matches!(pipeline.run(&[bad]), Err(Error::MosaicBuild(_))));
        assert!(matches!(pipeline.run(&[]), Err(Error::MosaicBuild(_))));
        assert!(matches!(pipeline.run_directory(input.path()), Err(_)));
        // Nothing created when there is nothing to do
        assert!(!out.path().join("site").exists());
    }

    #[test]
    fn test_invalid_config_rejected_before_work() {
        let out = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(out.path()).with_chunk_size(0));
        assert!(matches!(pipeline.run(&[PathBuf::from("x.tif")]), Err(Error::Config(_))));
    }

    #[test]
    fn test_manifest_guard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.vrt");
        fs::write(&path, "<VRTDataset/>").unwrap();
        drop(ManifestGuard { path: path.clone() });
        assert!(!path.exists());
        // Second drop of a missing file is silent
        drop(ManifestGuard { path });
    }
}
