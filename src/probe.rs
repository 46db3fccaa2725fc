//! Cheap emptiness check for a chunk window.
//!
//! The window is read at a fixed low resolution with nearest-neighbour
//! sampling, written to a scratch GeoTIFF and read back. The window is empty
//! when every sample of the thumbnail equals the nodata value. Features
//! smaller than one thumbnail pixel can be missed; that trade-off is accepted
//! for the speed-up on sparse mosaics.

use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::trace;

use crate::error::{Error, Result};
use crate::geometry::GeoTransform;
use crate::geotiff_writer::{GeoTiffWriter, RegionSource};
use crate::mosaic::Composite;
use crate::plan::ChunkWindow;
use crate::raster::SourceReader;
use crate::resample::{Region, ResamplingMethod};

/// Block edge of the scratch thumbnail.
const PROBE_BLOCK_SIZE: usize = 256;

/// Outcome of [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptinessVerdict {
    /// Every thumbnail sample equals the nodata value
    pub empty: bool,
    /// Edge length of the thumbnail that was inspected
    pub resolution: usize,
}

/// Classify `window` of `composite` as empty or not.
///
/// The scratch thumbnail lives in `scratch_dir` under a unique name and is
/// removed before this returns, on success and on error alike.
///
/// # Errors
/// Returns [`Error::Probe`] if the thumbnail cannot be produced or read back.
pub fn probe(
    composite: &Composite,
    window: ChunkWindow,
    probe_resolution: usize,
    nodata: f64,
    scratch_dir: &Path,
) -> Result<EmptinessVerdict> {
    let probe_err = |reason: String| Error::Probe { window, reason };
    if probe_resolution == 0 {
        return Err(probe_err("probe resolution must be positive".to_string()));
    }

    // Allow cast precision loss: window sizes stay far below 2^52
    #[allow(clippy::cast_precision_loss)]
    let region = Region::new(
        window.x_offset as f64,
        window.y_offset as f64,
        window.x_size as f64,
        window.y_size as f64,
    );
    let thumbnail = composite
        .read_region(region, probe_resolution, probe_resolution, ResamplingMethod::Nearest)
        .map_err(|e| probe_err(e.to_string()))?;

    let gt = composite.geo_transform();
    let (origin_x, origin_y) = gt.apply(region.x, region.y);
    let (px, py) = gt.pixel_size();
    #[allow(clippy::cast_precision_loss)]
    let res = probe_resolution as f64;
    let thumb_gt = GeoTransform::north_up(origin_x, origin_y, px * region.width / res, py * region.height / res);

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("probe_{}_{}_", window.x_offset, window.y_offset))
        .suffix(".tif")
        .tempfile_in(scratch_dir)
        .map_err(|e| probe_err(format!("creating scratch file: {e}")))?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        GeoTiffWriter::new(probe_resolution, probe_resolution, thumbnail.bands, composite.sample_type(), thumb_gt)
            .nodata(Some(nodata))
            .block_size(PROBE_BLOCK_SIZE)
            .write_to(&mut out, &thumbnail)
            .map_err(|e| probe_err(e.to_string()))?;
        out.flush().map_err(|e| probe_err(e.to_string()))?;
    }

    let pixels = SourceReader::open(tmp.path())
        .and_then(|reader| reader.read_all())
        .map_err(|e| probe_err(e.to_string()))?;
    // Allow truncation: nodata is a sample-type sentinel
    #[allow(clippy::cast_possible_truncation)]
    let empty = pixels.is_uniform(nodata as f32);
    trace!(%window, empty, path = %tmp.path().display(), "Probed window");

    Ok(EmptinessVerdict {
        empty,
        resolution: probe_resolution,
    })
}
