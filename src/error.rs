//! Error types for the chunking pipeline.

use std::path::PathBuf;

use crate::geotiff_writer::GeoTiffWriteError;
use crate::plan::ChunkWindow;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the pipeline stages.
///
/// `Probe` and `ChunkEncode` are scoped to one window; the executor records
/// them per job and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input raster could not be opened or decoded.
    #[error("failed to open raster source {}: {reason}", path.display())]
    SourceOpen { path: PathBuf, reason: String },

    /// No usable sources were left to mosaic.
    #[error("cannot build mosaic: {0}")]
    MosaicBuild(String),

    /// The mosaic manifest is missing or malformed.
    #[error("invalid mosaic manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("probe failed for {window}: {reason}")]
    Probe { window: ChunkWindow, reason: String },

    #[error("failed to encode {window}: {reason}")]
    ChunkEncode { window: ChunkWindow, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("projection error: {0}")]
    Projection(String),

    #[error(transparent)]
    GeoTiffWrite(#[from] GeoTiffWriteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn source_open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SourceOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn manifest(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
