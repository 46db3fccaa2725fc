//! Correction of rotated/sheared source geometry.
//!
//! Mosaicking needs every source on an axis-aligned grid. A source whose
//! geotransform carries rotation terms is warped once into
//! `<dir>/<stem>_aligned.tif`; later runs find that file and reuse it as-is.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::geometry::GeoTransform;
use crate::geotiff_writer::{GeoTiffCompression, GeoTiffWriter, RegionSource};
use crate::raster::{RasterBuffer, RasterSource, SourceReader};
use crate::resample::{sample, Region, ResamplingMethod, SampleScratch};

/// File-name marker of normalizer derivatives.
pub const ALIGNED_MARKER: &str = "_aligned";

/// Settings for [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeOptions {
    pub resampling: ResamplingMethod,
    /// Written outside the rotated footprint when the source declares no nodata
    pub nodata: f64,
    pub block_size: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            resampling: ResamplingMethod::Bilinear,
            nodata: 0.0,
            block_size: 512,
        }
    }
}

/// Path of the axis-aligned derivative for `path`.
#[must_use]
pub fn aligned_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    path.with_file_name(format!("{stem}{ALIGNED_MARKER}.tif"))
}

/// Whether `path` names a normalizer derivative.
#[must_use]
pub fn is_derivative(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().contains(ALIGNED_MARKER))
}

/// Return `source` unchanged when it is axis-aligned, otherwise the
/// axis-aligned derivative (created on first use).
///
/// # Errors
/// Returns [`Error::SourceOpen`] if the source or an existing derivative
/// cannot be read, and [`Error::Io`]/[`Error::GeoTiffWrite`] if writing the
/// derivative fails.
pub fn normalize(source: &RasterSource, options: &NormalizeOptions) -> Result<RasterSource> {
    if !source.needs_normalization() {
        return Ok(source.clone());
    }

    let target = aligned_path(&source.path);
    if target.exists() {
        debug!(path = %target.display(), "Reusing aligned derivative");
        return RasterSource::open(&target);
    }

    let reader = SourceReader::open(&source.path)?;
    let warp = Warp::new(&reader, options.nodata, options.resampling)?;
    info!(
        source = %source.path.display(),
        target = %target.display(),
        width = warp.width,
        height = warp.height,
        "Correcting skewed geometry"
    );

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".aligned-")
        .suffix(".tif.tmp")
        .tempfile_in(dir)?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        GeoTiffWriter::new(warp.width, warp.height, source.bands, source.sample_type, warp.geo_transform)
            .epsg(source.epsg)
            .nodata(Some(warp.nodata))
            .compression(GeoTiffCompression::Deflate)
            .block_size(options.block_size)
            .big_tiff(true)
            .write_to(&mut out, &warp)?;
        out.flush()?;
    }
    tmp.persist(&target).map_err(|e| Error::Io(e.error))?;

    RasterSource::open(&target)
}

/// Axis-aligned view over a rotated source.
struct Warp<'a> {
    reader: &'a SourceReader,
    /// Output pixel to source pixel
    to_source: GeoTransform,
    geo_transform: GeoTransform,
    width: usize,
    height: usize,
    nodata: f64,
    /// Kernel for the warp itself; the writer's level method is ignored
    method: ResamplingMethod,
}

impl<'a> Warp<'a> {
    fn new(reader: &'a SourceReader, default_nodata: f64, method: ResamplingMethod) -> Result<Self> {
        let src = reader.source();
        let footprint = src.bounds();
        let (px, py) = src.geo_transform.pixel_size();
        if !(px > 0.0 && py > 0.0) {
            return Err(Error::source_open(&src.path, "zero pixel size"));
        }
        let inverse = src
            .geo_transform
            .invert()
            .ok_or_else(|| Error::source_open(&src.path, "singular geotransform"))?;

        // Allow truncation: footprints are positive and far below usize::MAX pixels
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (width, height) = (
            ((footprint.width() / px).ceil() as usize).max(1),
            ((footprint.height() / py).ceil() as usize).max(1),
        );
        let geo_transform = GeoTransform::north_up(footprint.minx, footprint.maxy, px, py);

        // Compose output pixel -> world -> source pixel
        let g = geo_transform.0;
        let i = inverse.0;
        let to_source = GeoTransform([
            i[0] + i[1] * g[0] + i[2] * g[3],
            i[1] * g[1],
            i[2] * g[5],
            i[3] + i[4] * g[0] + i[5] * g[3],
            i[4] * g[1],
            i[5] * g[5],
        ]);

        Ok(Self {
            reader,
            to_source,
            geo_transform,
            width,
            height,
            nodata: src.nodata.unwrap_or(default_nodata),
            method,
        })
    }
}

impl RegionSource for Warp<'_> {
    fn read_region(
        &self,
        region: Region,
        out_width: usize,
        out_height: usize,
        _method: ResamplingMethod,
    ) -> Result<RasterBuffer> {
        let bands = self.reader.source().bands;
        // Allow truncation: nodata is a sample-type sentinel
        #[allow(clippy::cast_possible_truncation)]
        let fill = self.nodata as f32;
        let mut out = RasterBuffer::filled(out_width, out_height, bands, fill).with_nodata(Some(fill));
        if out_width == 0 || out_height == 0 {
            return Ok(out);
        }
        // Allow cast precision loss: output grids stay far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let (step_x, step_y) = (region.width / out_width as f64, region.height / out_height as f64);

        let mut pixels = self.reader.pixels()?;
        let mut scratch = SampleScratch::default();
        let mut value = vec![0.0_f32; bands];
        for oy in 0..out_height {
            #[allow(clippy::cast_precision_loss)]
            let cy = region.y + (oy as f64 + 0.5) * step_y;
            for ox in 0..out_width {
                #[allow(clippy::cast_precision_loss)]
                let cx = region.x + (ox as f64 + 0.5) * step_x;
                let (sx, sy) = self.to_source.apply(cx, cy);
                if sample(&mut pixels, sx, sy, step_x, step_y, self.method, &mut scratch, &mut value)? {
                    out.pixel_mut(ox, oy).copy_from_slice(&value);
                }
            }
        }
        Ok(out)
    }
}
