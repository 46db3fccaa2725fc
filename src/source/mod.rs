//! Input discovery.
//!
//! Lists the raster files a run should consume. Only file-system metadata is
//! read here; opening and validating the rasters happens in the pipeline so a
//! bad file is logged and skipped rather than aborting discovery.
//!
//! # Example
//!
//! ```rust,no_run
//! use cogchunk::source::{LocalInputSource, LocalScanOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let source = LocalInputSource::scan("/data/tiles", &LocalScanOptions::with_extension("tiff"))?;
//!     for entry in source.entries() {
//!         println!("Found input: {} ({} bytes)", entry.name, entry.size_bytes);
//!     }
//!     Ok(())
//! }
//! ```

pub mod local;

pub use local::{LocalInputSource, LocalScanOptions, LocalSourceStats};

use std::path::PathBuf;

/// A discovered input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// File stem
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

