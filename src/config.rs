//! Pipeline configuration.

use std::path::{Path, PathBuf};

use crate::encode::EncodeParams;
use crate::error::{Error, Result};
use crate::resample::ResamplingMethod;
use crate::tile_cache::DEFAULT_CAPACITY_BYTES;

/// File name of the mosaic manifest inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "output.vrt";

/// Everything a [`Pipeline`](crate::pipeline::Pipeline) run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Directory receiving the manifest and the chunk files
    pub output_dir: PathBuf,
    /// Input file suffix matched during discovery (case-insensitive)
    pub extension: String,
    /// Edge length of a chunk window in composite pixels
    pub chunk_size: usize,
    pub workers: usize,
    /// Edge length of the emptiness-probe thumbnail
    pub probe_resolution: usize,
    /// Where probe thumbnails are written; defaults to the output directory
    pub scratch_dir: Option<PathBuf>,
    /// Decoded-chunk cache budget per worker
    pub cache_bytes: usize,
    pub encode: EncodeParams,
}

impl PipelineConfig {
    /// Defaults for everything but the output directory.
    #[must_use]
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            extension: "tif".to_string(),
            chunk_size: 65536,
            workers: 2,
            probe_resolution: 1024,
            scratch_dir: None,
            cache_bytes: DEFAULT_CAPACITY_BYTES,
            encode: EncodeParams::default(),
        }
    }

    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_probe_resolution(mut self, probe_resolution: usize) -> Self {
        self.probe_resolution = probe_resolution;
        self
    }

    #[must_use]
    pub fn with_scratch_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.scratch_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn with_cache_bytes(mut self, cache_bytes: usize) -> Self {
        self.cache_bytes = cache_bytes;
        self
    }

    #[must_use]
    pub fn with_resampling(mut self, resampling: ResamplingMethod) -> Self {
        self.encode.resampling = resampling;
        self
    }

    #[must_use]
    pub fn with_overview_count(mut self, count: usize) -> Self {
        self.encode.overview_count = count;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.encode.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_target_epsg(mut self, epsg: u32) -> Self {
        self.encode.target_epsg = epsg;
        self
    }

    /// 1-based band indices to keep, in output order
    #[must_use]
    pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
        self.encode.bands = bands;
        self
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.encode.nodata = nodata;
        self
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.scratch_dir.as_deref().unwrap_or(&self.output_dir)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));
        if self.chunk_size == 0 {
            return fail("chunk size must be positive".to_string());
        }
        if self.workers == 0 {
            return fail("worker count must be positive".to_string());
        }
        if self.probe_resolution == 0 {
            return fail("probe resolution must be positive".to_string());
        }
        let block = self.encode.block_size;
        if block == 0 || block % 16 != 0 {
            return fail(format!("block size {block} is not a positive multiple of 16"));
        }
        if self.encode.bands.is_empty() {
            return fail("band list is empty".to_string());
        }
        if let Some(&bad) = self.encode.bands.iter().find(|&&b| b == 0) {
            return fail(format!("band indices are 1-based, got {bad}"));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return fail("input extension is empty".to_string());
        }
        if !self.encode.nodata.is_finite() {
            return fail("nodata must be finite".to_string());
        }
        Ok(())
    }
}

/// Parse a comma-separated, 1-based band list such as `1,2,3`.
///
/// # Errors
/// Returns [`Error::Config`] for empty or non-numeric entries.
pub fn parse_band_list(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid band index '{part}'")))
        })
        .collect()
}
