#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`raster`]: GeoTIFF source metadata, decoding handles and pixel buffers
//! - [`normalize`]: Axis-aligned derivatives of rotated sources
//! - [`mosaic`]: Virtual composite over many sources, persisted as a manifest
//! - [`plan`]: Chunk grid over the composite extent
//! - [`probe`]: Low-resolution emptiness check per window
//! - [`encode`]: Full-resolution chunk encoding
//! - [`executor`]: Fixed-size worker pool with progress accounting
//! - [`pipeline`]: End-to-end orchestration
//! - [`geotiff_writer`]: Tiled GeoTIFF/BigTIFF writer with overviews
//! - [`resample`]: Nearest, bilinear and average kernels
//! - [`geometry`]: Geotransforms, extents and projections
//! - [`source`]: Input discovery
//! - [`tile_cache`]: Per-handle LRU cache of decoded chunks

// ============================================================================
// Public modules
// ============================================================================

pub mod config;
pub mod encode;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod geotiff_writer;
pub mod mosaic;
pub mod normalize;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod raster;
pub mod resample;
pub mod source;
pub mod tile_cache;

// ============================================================================
// Errors & Configuration
// ============================================================================

pub use error::{Error, Result};
pub use config::{PipelineConfig, parse_band_list, MANIFEST_FILE_NAME};

// ============================================================================
// Pipeline
// ============================================================================
// Primary API: Pipeline::new(config).run_directory(dir)

pub use pipeline::{
    ChunkJob,
    Pipeline,
    RunSummary,
};

// ============================================================================
// Pipeline Stages
// ============================================================================

pub use normalize::{normalize, NormalizeOptions};
pub use mosaic::{build, Composite, MosaicLayout};
pub use plan::{plan, ChunkPlan, ChunkWindow};
pub use probe::{probe, EmptinessVerdict};
pub use encode::{encode, EncodeParams, EncodedChunk};
pub use executor::{
    ChunkWorker,
    ExecutionReport,
    Executor,
    JobFailure,
    JobOutcome,
    Progress,
};

// ============================================================================
// Rasters & Resampling
// ============================================================================

pub use raster::{RasterBuffer, RasterSource, SampleType, SourceReader};
pub use resample::ResamplingMethod;

// ============================================================================
// Geometry & Projections
// ============================================================================

pub use geometry::{BoundingBox, GeoTransform};
pub use geometry::projection::{
    project_bounds,
    project_point,
    get_proj_string,
    is_geographic_crs,
};

// ============================================================================
// Source Discovery
// ============================================================================

pub use source::{
    InputEntry,
    LocalInputSource,
    LocalScanOptions,
    LocalSourceStats,
};

// ============================================================================
// Caching
// ============================================================================

pub use tile_cache::TileCache;

// ============================================================================
// GeoTIFF Writing
// ============================================================================

pub use geotiff_writer::{
    GeoTiffCompression,
    GeoTiffWriteError,
    GeoTiffWriter,
    RegionSource,
    WriteReport,
};
