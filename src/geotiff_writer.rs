//! Tiled GeoTIFF writer with overview pyramid and sparse tiles.
//!
//! Output layout: one full-resolution IFD followed by `overview_count`
//! reduced-resolution IFDs (`NewSubfileType = 1`), each halving the previous
//! level. Pixels are pulled block by block from a [`RegionSource`], so a level
//! is never held in memory as a whole. With `sparse` enabled, tiles whose
//! samples all equal the nodata value are not written at all: their offset
//! and byte count are recorded as zero, which GDAL-compatible readers treat
//! as nodata.
//!
//! # Example
//!
//! ```rust,no_run
//! use cogchunk::geometry::GeoTransform;
//! use cogchunk::geotiff_writer::{GeoTiffCompression, GeoTiffWriter};
//! use cogchunk::raster::{RasterBuffer, SampleType};
//! use cogchunk::resample::ResamplingMethod;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let raster = RasterBuffer::filled(1024, 1024, 3, 128.0);
//!     GeoTiffWriter::new(1024, 1024, 3, SampleType::U8, GeoTransform::north_up(0.0, 1024.0, 1.0, 1.0))
//!         .compression(GeoTiffCompression::Deflate)
//!         .overviews(4, ResamplingMethod::Average)
//!         .epsg(Some(32610))
//!         .write_buffer("output.tif", &raster)?;
//!     Ok(())
//! }
//! ```

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use flate2::write::ZlibEncoder;
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::geometry::projection::{get_proj_string, is_geographic_crs};
use crate::geometry::GeoTransform;
use crate::raster::{
    RasterBuffer, SampleType, GDAL_NODATA, GEOGRAPHIC_TYPE_GEO_KEY, GEOTIFF_GEOKEYDIRECTORY,
    GEOTIFF_MODELPIXELSCALE, GEOTIFF_MODELTIEPOINT, GEOTIFF_MODELTRANSFORMATION, PROJECTED_CS_TYPE_GEO_KEY,
};
use crate::resample::{resample_region, Region, ResamplingMethod};

const GEOTIFF_GEOASCIIPARAMS: u16 = 34737;

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

// TIFF field values
const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_DEFLATE: u16 = 8;
const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
const PHOTOMETRIC_RGB: u16 = 2;
const SUBFILE_REDUCED_IMAGE: u32 = 1;

/// Compression method for GeoTIFF output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GeoTiffCompression {
    /// No compression - fastest but largest files
    None,
    /// Deflate (zlib) compression
    #[default]
    Deflate,
}

/// Error type for GeoTIFF writing operations
#[derive(Debug, thiserror::Error)]
pub enum GeoTiffWriteError {
    /// TIFF encoding error
    #[error("TIFF encoding error: {0}")]
    TiffEncode(String),
    /// Invalid raster layout or parameters
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<tiff::TiffError> for GeoTiffWriteError {
    fn from(e: tiff::TiffError) -> Self {
        Self::TiffEncode(e.to_string())
    }
}

/// Supplies full-resolution pixels to the writer.
///
/// `region` is expressed in the writer's full-resolution pixel space; overview
/// levels ask for larger regions resampled onto a smaller grid.
pub trait RegionSource {
    /// Read `region` resampled to `out_width x out_height`, all output bands.
    ///
    /// # Errors
    /// Any failure to produce pixels aborts the write.
    fn read_region(
        &self,
        region: Region,
        out_width: usize,
        out_height: usize,
        method: ResamplingMethod,
    ) -> Result<RasterBuffer>;
}

impl RegionSource for RasterBuffer {
    fn read_region(
        &self,
        region: Region,
        out_width: usize,
        out_height: usize,
        method: ResamplingMethod,
    ) -> Result<RasterBuffer> {
        let fill = self.nodata.unwrap_or(0.0);
        resample_region(&mut &*self, region, out_width, out_height, method, fill)
    }
}

/// Summary of one written file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Reduced-resolution levels written after the base image
    pub overview_count: usize,
    /// Tiles stored, across all levels
    pub tiles_written: usize,
    /// All-nodata tiles omitted, across all levels
    pub tiles_omitted: usize,
}

/// Builder for configuring GeoTIFF output
#[derive(Debug, Clone)]
pub struct GeoTiffWriter {
    width: usize,
    height: usize,
    bands: usize,
    sample_type: SampleType,
    geo_transform: GeoTransform,
    epsg: Option<u32>,
    nodata: Option<f64>,
    compression: GeoTiffCompression,
    block_size: usize,
    overview_count: usize,
    resampling: ResamplingMethod,
    sparse: bool,
    big_tiff: bool,
}

impl GeoTiffWriter {
    /// Writer for a `width x height` raster with `bands` output bands.
    ///
    /// Defaults: uncompressed, 256 pixel tiles, no overviews, classic TIFF.
    #[must_use]
    pub fn new(width: usize, height: usize, bands: usize, sample_type: SampleType, geo_transform: GeoTransform) -> Self {
        Self {
            width,
            height,
            bands,
            sample_type,
            geo_transform,
            epsg: None,
            nodata: None,
            compression: GeoTiffCompression::None,
            block_size: 256,
            overview_count: 0,
            resampling: ResamplingMethod::Nearest,
            sparse: false,
            big_tiff: false,
        }
    }

    /// Set the compression method
    #[must_use]
    pub fn compression(mut self, compression: GeoTiffCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Internal tile edge in pixels
    #[must_use]
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Number of reduced-resolution levels and the method used to build them
    #[must_use]
    pub fn overviews(mut self, count: usize, resampling: ResamplingMethod) -> Self {
        self.overview_count = count;
        self.resampling = resampling;
        self
    }

    #[must_use]
    pub fn epsg(mut self, epsg: Option<u32>) -> Self {
        self.epsg = epsg;
        self
    }

    #[must_use]
    pub fn nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    /// Omit tiles that contain only nodata
    #[must_use]
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Use 64-bit offsets (BigTIFF)
    #[must_use]
    pub fn big_tiff(mut self, big_tiff: bool) -> Self {
        self.big_tiff = big_tiff;
        self
    }

    /// Dimensions of level `level` (0 = full resolution).
    #[must_use]
    pub fn level_dimensions(&self, level: usize) -> (usize, usize) {
        let factor = 1usize.checked_shl(u32::try_from(level).unwrap_or(u32::MAX)).unwrap_or(usize::MAX);
        (self.width.div_ceil(factor).max(1), self.height.div_ceil(factor).max(1))
    }

    /// Write an in-memory raster to a file path
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the buffer layout does not match.
    pub fn write_buffer<P: AsRef<Path>>(&self, path: P, raster: &RasterBuffer) -> Result<WriteReport> {
        if raster.width != self.width || raster.height != self.height || raster.bands != self.bands {
            return Err(GeoTiffWriteError::InvalidData(format!(
                "buffer is {}x{}x{}, writer expects {}x{}x{}",
                raster.width, raster.height, raster.bands, self.width, self.height, self.bands
            ))
            .into());
        }
        self.write(path, raster)
    }

    /// Write to a file path, pulling pixels from `source`
    ///
    /// # Errors
    /// Returns an error on I/O failure, encoding failure or source failure.
    pub fn write<P: AsRef<Path>, S: RegionSource + ?Sized>(&self, path: P, source: &S) -> Result<WriteReport> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let report = self.write_to(&mut writer, source)?;
        writer.flush()?;
        Ok(report)
    }

    /// Write to any writer that implements Write + Seek
    ///
    /// # Errors
    /// Returns an error on encoding failure or source failure.
    pub fn write_to<W: Write + Seek, S: RegionSource + ?Sized>(&self, writer: W, source: &S) -> Result<WriteReport> {
        self.validate()?;
        if self.big_tiff {
            let mut encoder = TiffEncoder::new_big(writer).map_err(GeoTiffWriteError::from)?;
            self.write_levels(&mut encoder, source)
        } else {
            let mut encoder = TiffEncoder::new(writer).map_err(GeoTiffWriteError::from)?;
            self.write_levels(&mut encoder, source)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GeoTiffWriteError::InvalidData("Raster has zero dimensions".to_string()).into());
        }
        if self.bands == 0 {
            return Err(GeoTiffWriteError::InvalidData("Raster has no bands".to_string()).into());
        }
        // TIFF requires tile edges to be multiples of 16
        if self.block_size == 0 || self.block_size % 16 != 0 {
            return Err(GeoTiffWriteError::InvalidData(format!(
                "block size {} is not a positive multiple of 16",
                self.block_size
            ))
            .into());
        }
        Ok(())
    }

    fn write_levels<W: Write + Seek, K: TiffKind, S: RegionSource + ?Sized>(
        &self,
        encoder: &mut TiffEncoder<W, K>,
        source: &S,
    ) -> Result<WriteReport> {
        let mut report = WriteReport {
            overview_count: self.overview_count,
            ..WriteReport::default()
        };
        for level in 0..=self.overview_count {
            let mut dir = encoder.new_directory().map_err(GeoTiffWriteError::from)?;
            self.write_level(&mut dir, level, source, &mut report)?;
            dir.finish().map_err(GeoTiffWriteError::from)?;
        }
        Ok(report)
    }

    fn write_level<W: Write + Seek, K: TiffKind, S: RegionSource + ?Sized>(
        &self,
        dir: &mut DirectoryEncoder<'_, W, K>,
        level: usize,
        source: &S,
        report: &mut WriteReport,
    ) -> Result<()> {
        let (level_width, level_height) = self.level_dimensions(level);
        let block = self.block_size;
        let tiles_across = level_width.div_ceil(block);
        let tiles_down = level_height.div_ceil(block);
        // Allow cast precision loss: raster dimensions stay far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let (scale_x, scale_y) = (
            self.width as f64 / level_width as f64,
            self.height as f64 / level_height as f64,
        );
        let method = if level == 0 { ResamplingMethod::Nearest } else { self.resampling };
        #[allow(clippy::cast_possible_truncation)]
        let fill = self.nodata.unwrap_or(0.0) as f32;

        let mut offsets: Vec<u64> = Vec::with_capacity(tiles_across * tiles_down);
        let mut byte_counts: Vec<u64> = Vec::with_capacity(tiles_across * tiles_down);
        for tile_row in 0..tiles_down {
            for tile_col in 0..tiles_across {
                let x0 = tile_col * block;
                let y0 = tile_row * block;
                let valid_w = block.min(level_width - x0);
                let valid_h = block.min(level_height - y0);
                #[allow(clippy::cast_precision_loss)]
                let region = Region::new(
                    x0 as f64 * scale_x,
                    y0 as f64 * scale_y,
                    valid_w as f64 * scale_x,
                    valid_h as f64 * scale_y,
                );
                let pixels = source.read_region(region, valid_w, valid_h, method)?;
                if pixels.bands != self.bands {
                    return Err(GeoTiffWriteError::InvalidData(format!(
                        "source produced {} bands, writer expects {}",
                        pixels.bands, self.bands
                    ))
                    .into());
                }

                if self.sparse && pixels.is_uniform(fill) {
                    offsets.push(0);
                    byte_counts.push(0);
                    report.tiles_omitted += 1;
                    continue;
                }

                let bytes = self.encode_tile(&pixels, fill)?;
                let offset = dir.write_data(bytes.as_slice()).map_err(GeoTiffWriteError::from)?;
                offsets.push(offset);
                byte_counts.push(bytes.len() as u64);
                report.tiles_written += 1;
            }
        }

        let (width_u32, height_u32, block_u32) = (
            to_u32(level_width)?,
            to_u32(level_height)?,
            to_u32(block)?,
        );
        let bands_u16 = u16::try_from(self.bands)
            .map_err(|_| GeoTiffWriteError::InvalidData(format!("{} bands is too many", self.bands)))?;

        let enc = |e: tiff::TiffError| GeoTiffWriteError::from(e);
        if level > 0 {
            dir.write_tag(Tag::NewSubfileType, SUBFILE_REDUCED_IMAGE).map_err(enc)?;
        }
        dir.write_tag(Tag::ImageWidth, width_u32).map_err(enc)?;
        dir.write_tag(Tag::ImageLength, height_u32).map_err(enc)?;
        let bits_per_sample = vec![self.sample_type.bits(); self.bands];
        dir.write_tag(Tag::BitsPerSample, bits_per_sample.as_slice()).map_err(enc)?;
        let compression_tag = match self.compression {
            GeoTiffCompression::None => COMPRESSION_NONE,
            GeoTiffCompression::Deflate => COMPRESSION_DEFLATE,
        };
        dir.write_tag(Tag::Compression, compression_tag).map_err(enc)?;
        dir.write_tag(Tag::PhotometricInterpretation, self.photometric()).map_err(enc)?;
        dir.write_tag(Tag::SamplesPerPixel, bands_u16).map_err(enc)?;
        let sample_format = vec![self.sample_type.sample_format(); self.bands];
        dir.write_tag(Tag::SampleFormat, sample_format.as_slice()).map_err(enc)?;
        // PlanarConfiguration: 1 = Chunky (interleaved RGBRGB...)
        dir.write_tag(Tag::PlanarConfiguration, 1u16).map_err(enc)?;
        dir.write_tag(Tag::TileWidth, block_u32).map_err(enc)?;
        dir.write_tag(Tag::TileLength, block_u32).map_err(enc)?;

        let extra = self.extra_samples();
        if extra > 0 {
            // Unspecified meaning for every band past the colour model
            let extra_samples: Vec<u16> = vec![0; extra];
            dir.write_tag(Tag::ExtraSamples, extra_samples.as_slice()).map_err(enc)?;
        }

        if self.big_tiff {
            dir.write_tag(Tag::TileOffsets, offsets.as_slice()).map_err(enc)?;
            dir.write_tag(Tag::TileByteCounts, byte_counts.as_slice()).map_err(enc)?;
        } else {
            let offsets = narrow_offsets(&offsets)?;
            let byte_counts = narrow_offsets(&byte_counts)?;
            dir.write_tag(Tag::TileOffsets, offsets.as_slice()).map_err(enc)?;
            dir.write_tag(Tag::TileByteCounts, byte_counts.as_slice()).map_err(enc)?;
        }

        if let Some(nodata) = self.nodata {
            dir.write_tag(Tag::Unknown(GDAL_NODATA), format_nodata(nodata).as_str())
                .map_err(enc)?;
        }

        if level == 0 {
            self.write_geotiff_tags(dir)?;
        }
        Ok(())
    }

    /// Serialize one tile, padding partial edge tiles to the full block with `fill`.
    fn encode_tile(&self, pixels: &RasterBuffer, fill: f32) -> Result<Vec<u8>> {
        let block = self.block_size;
        let mut raw = Vec::with_capacity(block * block * self.bands * self.sample_type.size());
        for y in 0..block {
            for x in 0..block {
                if x < pixels.width && y < pixels.height {
                    for &v in pixels.pixel(x, y) {
                        self.sample_type.push_le(v, &mut raw);
                    }
                } else {
                    for _ in 0..self.bands {
                        self.sample_type.push_le(fill, &mut raw);
                    }
                }
            }
        }

        match self.compression {
            GeoTiffCompression::None => Ok(raw),
            GeoTiffCompression::Deflate => {
                let mut zlib = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                zlib.write_all(&raw)?;
                Ok(zlib.finish()?)
            }
        }
    }

    fn photometric(&self) -> u16 {
        if matches!(self.bands, 3 | 4) && self.sample_type != SampleType::F32 {
            PHOTOMETRIC_RGB
        } else {
            PHOTOMETRIC_MIN_IS_BLACK
        }
    }

    fn extra_samples(&self) -> usize {
        if self.photometric() == PHOTOMETRIC_RGB {
            self.bands - 3
        } else {
            self.bands - 1
        }
    }

    fn write_geotiff_tags<W: Write + Seek, K: TiffKind>(&self, dir: &mut DirectoryEncoder<'_, W, K>) -> Result<()> {
        let enc = |e: tiff::TiffError| GeoTiffWriteError::from(e);
        let gt = &self.geo_transform;

        if gt.has_shear() {
            let matrix = gt.to_model_transformation();
            dir.write_tag(Tag::Unknown(GEOTIFF_MODELTRANSFORMATION), matrix.as_slice())
                .map_err(enc)?;
        } else {
            // ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
            let pixel_scale = [gt.0[1], -gt.0[5], 0.0];
            dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())
                .map_err(enc)?;
            // ModelTiepoint: pixel (0, 0) to the upper-left world corner
            let (origin_x, origin_y) = gt.origin();
            let tiepoint = [0.0, 0.0, 0.0, origin_x, origin_y, 0.0];
            dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())
                .map_err(enc)?;
        }

        let geokeys = self.build_geokey_directory();
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())
            .map_err(enc)?;

        if let Some(proj_string) = self.epsg.and_then(get_proj_string) {
            // GeoAsciiParams entries are pipe-terminated
            let ascii_params = format!("{proj_string}|");
            dir.write_tag(Tag::Unknown(GEOTIFF_GEOASCIIPARAMS), ascii_params.as_str())
                .map_err(enc)?;
        }
        Ok(())
    }

    fn build_geokey_directory(&self) -> Vec<u16> {
        // GeoKeyDirectory structure:
        // [KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys,
        //  KeyID1, TIFFTagLocation1, Count1, Value_Offset1, ...]
        let code = self.epsg.and_then(|c| u16::try_from(c).ok());
        let is_geographic = self.epsg.is_some_and(is_geographic_crs);

        let mut keys = vec![1, 1, 0, 0];
        keys.extend_from_slice(&[
            GT_MODEL_TYPE_GEO_KEY,
            0,
            1,
            if is_geographic { MODEL_TYPE_GEOGRAPHIC } else { MODEL_TYPE_PROJECTED },
        ]);
        keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
        if let Some(code) = code {
            let key = if is_geographic { GEOGRAPHIC_TYPE_GEO_KEY } else { PROJECTED_CS_TYPE_GEO_KEY };
            keys.extend_from_slice(&[key, 0, 1, code]);
        }
        // Allow truncation: at most three keys
        #[allow(clippy::cast_possible_truncation)]
        {
            keys[3] = ((keys.len() - 4) / 4) as u16;
        }
        keys
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| GeoTiffWriteError::InvalidData(format!("value {value} exceeds u32 maximum")).into())
}

fn narrow_offsets(values: &[u64]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .map_err(|_| Error::from(GeoTiffWriteError::InvalidData(format!("offset {v} needs BigTIFF"))))
        })
        .collect()
}

/// Nodata as GDAL writes it: integral values without a fractional part.
fn format_nodata(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}
