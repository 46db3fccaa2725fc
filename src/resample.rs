//! Resampling kernels shared by the mosaic reader, the normalizer warp and the
//! overview builder.

use std::fmt;
use std::str::FromStr;

use crate::error::Result;
use crate::raster::RasterBuffer;

/// Resampling method used when a read changes resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResamplingMethod {
    /// Nearest neighbour - preserves crisp edges, never invents values
    Nearest,
    /// Bilinear interpolation of the four surrounding pixel centres
    #[default]
    Bilinear,
    /// Mean of every source pixel under the output pixel's footprint
    Average,
}

impl ResamplingMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Average => "average",
        }
    }
}

impl fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResamplingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "near" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "average" | "avg" => Ok(Self::Average),
            other => Err(format!("unknown resampling method '{other}' (expected nearest, bilinear or average)")),
        }
    }
}

/// Random access to whole pixels of a raster, all bands at once.
pub trait PixelFetch {
    fn dimensions(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    /// Declared nodata value; matching samples are ignored by the kernels.
    fn nodata(&self) -> Option<f32>;

    /// Copy pixel `(col, row)` into `out` (`out.len() == band_count()`).
    fn fetch(&mut self, col: usize, row: usize, out: &mut [f32]) -> Result<()>;
}

/// Fractional rectangle in the pixel space of a source raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }
}

/// Reusable per-call buffers so the hot loop does not allocate.
#[derive(Debug, Default)]
pub struct SampleScratch {
    pixel: Vec<f32>,
    acc: Vec<f64>,
    weight: Vec<f64>,
}

/// Sample `src` at the continuous position `(fx, fy)` (pixel centres sit at
/// `i + 0.5`) for an output pixel covering `fw x fh` source pixels.
///
/// Writes into `out` and returns `Ok(false)` when the position falls outside
/// the raster or every contributing sample is nodata.
// Allow truncation: fx/fy are non-negative and inside the raster once used as indices
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::too_many_arguments)]
pub fn sample<F: PixelFetch + ?Sized>(
    src: &mut F,
    fx: f64,
    fy: f64,
    fw: f64,
    fh: f64,
    method: ResamplingMethod,
    scratch: &mut SampleScratch,
    out: &mut [f32],
) -> Result<bool> {
    let (width, height) = src.dimensions();
    // Allow cast precision loss: raster dimensions stay far below 2^52
    #[allow(clippy::cast_precision_loss)]
    let (wf, hf) = (width as f64, height as f64);
    if width == 0 || height == 0 || fx < 0.0 || fy < 0.0 || fx >= wf || fy >= hf {
        return Ok(false);
    }

    let bands = src.band_count();
    scratch.pixel.resize(bands, 0.0);
    scratch.acc.clear();
    scratch.acc.resize(bands, 0.0);
    scratch.weight.clear();
    scratch.weight.resize(bands, 0.0);
    let nodata = src.nodata();

    match method {
        ResamplingMethod::Nearest => {
            let col = (fx as usize).min(width - 1);
            let row = (fy as usize).min(height - 1);
            src.fetch(col, row, out)?;
            return Ok(nodata.map_or(true, |nd| out.iter().any(|&v| v != nd)));
        }
        ResamplingMethod::Bilinear => {
            let x = (fx - 0.5).clamp(0.0, wf - 1.0);
            let y = (fy - 0.5).clamp(0.0, hf - 1.0);
            let x0 = x.floor() as usize;
            let y0 = y.floor() as usize;
            let x1 = (x0 + 1).min(width - 1);
            let y1 = (y0 + 1).min(height - 1);
            let tx = x - x.floor();
            let ty = y - y.floor();
            let taps = [
                (x0, y0, (1.0 - tx) * (1.0 - ty)),
                (x1, y0, tx * (1.0 - ty)),
                (x0, y1, (1.0 - tx) * ty),
                (x1, y1, tx * ty),
            ];
            for (col, row, w) in taps {
                if w == 0.0 {
                    continue;
                }
                accumulate(src, col, row, w, nodata, scratch)?;
            }
        }
        ResamplingMethod::Average => {
            let x_start = (fx - fw / 2.0).max(0.0);
            let y_start = (fy - fh / 2.0).max(0.0);
            let c0 = x_start.floor() as usize;
            let r0 = y_start.floor() as usize;
            let c1 = ((fx + fw / 2.0).ceil() as usize).clamp(c0 + 1, width);
            let r1 = ((fy + fh / 2.0).ceil() as usize).clamp(r0 + 1, height);
            for row in r0..r1 {
                for col in c0..c1 {
                    accumulate(src, col, row, 1.0, nodata, scratch)?;
                }
            }
        }
    }

    let mut any = false;
    for (band, value) in out.iter_mut().enumerate().take(bands) {
        let weight = scratch.weight[band];
        if weight > 0.0 {
            *value = (scratch.acc[band] / weight) as f32;
            any = true;
        } else {
            *value = nodata.unwrap_or(0.0);
        }
    }
    Ok(any)
}

/// Resample `region` of `src` onto an `out_width x out_height` grid.
///
/// Output pixels with no valid contribution are set to `fill`.
///
/// # Errors
/// Propagates fetch failures from `src`.
pub fn resample_region<F: PixelFetch + ?Sized>(
    src: &mut F,
    region: Region,
    out_width: usize,
    out_height: usize,
    method: ResamplingMethod,
    fill: f32,
) -> Result<RasterBuffer> {
    let bands = src.band_count();
    let mut out = RasterBuffer::filled(out_width, out_height, bands, fill);
    if out_width == 0 || out_height == 0 {
        return Ok(out);
    }
    // Allow cast precision loss: output grids stay far below 2^52
    #[allow(clippy::cast_precision_loss)]
    let (step_x, step_y) = (region.width / out_width as f64, region.height / out_height as f64);
    let mut scratch = SampleScratch::default();
    let mut value = vec![0.0_f32; bands];
    for oy in 0..out_height {
        #[allow(clippy::cast_precision_loss)]
        let fy = region.y + (oy as f64 + 0.5) * step_y;
        for ox in 0..out_width {
            #[allow(clippy::cast_precision_loss)]
            let fx = region.x + (ox as f64 + 0.5) * step_x;
            if sample(src, fx, fy, step_x, step_y, method, &mut scratch, &mut value)? {
                out.pixel_mut(ox, oy).copy_from_slice(&value);
            }
        }
    }
    Ok(out)
}

fn accumulate<F: PixelFetch + ?Sized>(
    src: &mut F,
    col: usize,
    row: usize,
    weight: f64,
    nodata: Option<f32>,
    scratch: &mut SampleScratch,
) -> Result<()> {
    src.fetch(col, row, &mut scratch.pixel)?;
    if let Some(nd) = nodata {
        if scratch.pixel.iter().all(|&v| v == nd) {
            return Ok(());
        }
    }
    for (band, &v) in scratch.pixel.iter().enumerate() {
        scratch.acc[band] += f64::from(v) * weight;
        scratch.weight[band] += weight;
    }
    Ok(())
}
