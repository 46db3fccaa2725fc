//! Raster sources: GeoTIFF metadata, scoped decoding handles and in-memory
//! pixel buffers.
//!
//! [`RasterSource`] is the immutable description of one input file.
//! [`SourceReader`] is the handle that owns the open file; dropping it
//! closes the file on every exit path. Strips and tiles are read straight
//! from their stored offsets and inflated here, so any band count and sample
//! type decodes. Decoded chunks are kept in a per-handle [`TileCache`] so
//! neighbouring reads do not decode twice.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use flate2::read::ZlibDecoder;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, GeoTransform};
use crate::resample::PixelFetch;
use crate::tile_cache::{DecodedChunk, TileCache, DEFAULT_CAPACITY_BYTES};

// GeoTIFF / GDAL private tag IDs
pub(crate) const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
pub(crate) const GEOTIFF_MODELTIEPOINT: u16 = 33922;
pub(crate) const GEOTIFF_MODELTRANSFORMATION: u16 = 34264;
pub(crate) const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
pub(crate) const GDAL_NODATA: u16 = 42113;

// GeoKey IDs
pub(crate) const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
pub(crate) const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

/// Resolve a numeric tag to whichever `Tag` variant the decoder stores it under.
pub(crate) fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Sample storage type carried from the inputs to the outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SampleType {
    #[default]
    U8,
    U16,
    F32,
}

impl SampleType {
    #[must_use]
    pub fn bits(&self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::U16 => 16,
            Self::F32 => 32,
        }
    }

    /// TIFF `SampleFormat` value (1 = unsigned int, 3 = IEEE float).
    #[must_use]
    pub fn sample_format(&self) -> u16 {
        match self {
            Self::U8 | Self::U16 => 1,
            Self::F32 => 3,
        }
    }

    /// Bytes per sample.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::from(self.bits() / 8)
    }

    /// Map decoder tags onto a storage type; anything that is not 8/16-bit
    /// unsigned is carried as `f32`.
    #[must_use]
    pub fn from_tags(bits: u32, sample_format: u32) -> Self {
        match (bits, sample_format) {
            (8, 1) => Self::U8,
            (16, 1) => Self::U16,
            _ => Self::F32,
        }
    }

    /// Append `value` converted (rounded and clamped for integers) in
    /// little-endian order.
    // Allow truncation: values are clamped to the target range first
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn push_le(&self, value: f32, out: &mut Vec<u8>) {
        match self {
            Self::U8 => out.push(value.round().clamp(0.0, 255.0) as u8),
            Self::U16 => out.extend_from_slice(&(value.round().clamp(0.0, 65535.0) as u16).to_le_bytes()),
            Self::F32 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::F32 => "f32",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "u8" => Ok(Self::U8),
            "u16" => Ok(Self::U16),
            "f32" => Ok(Self::F32),
            other => Err(format!("unknown sample type '{other}'")),
        }
    }
}

/// In-memory raster, samples interleaved by band (`R,G,B,R,G,B,...`).
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    pub pixels: Vec<f32>,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub nodata: Option<f32>,
}

impl RasterBuffer {
    /// Buffer with every sample set to `value`.
    #[must_use]
    pub fn filled(width: usize, height: usize, bands: usize, value: f32) -> Self {
        Self {
            pixels: vec![value; width * height * bands],
            width,
            height,
            bands,
            nodata: None,
        }
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: Option<f32>) -> Self {
        self.nodata = nodata;
        self
    }

    #[inline]
    #[must_use]
    pub fn get(&self, x: usize, y: usize, band: usize) -> f32 {
        self.pixels[(y * self.width + x) * self.bands + band]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, band: usize, value: f32) {
        self.pixels[(y * self.width + x) * self.bands + band] = value;
    }

    /// All samples of pixel `(x, y)`.
    #[inline]
    #[must_use]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let start = (y * self.width + x) * self.bands;
        &self.pixels[start..start + self.bands]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [f32] {
        let start = (y * self.width + x) * self.bands;
        &mut self.pixels[start..start + self.bands]
    }

    /// Whether every sample equals `value`.
    #[must_use]
    pub fn is_uniform(&self, value: f32) -> bool {
        self.pixels.iter().all(|&v| v == value)
    }

    /// New buffer holding only the given 0-based bands, in the given order.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a band index is out of range.
    pub fn select_bands(&self, bands: &[usize]) -> Result<RasterBuffer> {
        if let Some(&bad) = bands.iter().find(|&&b| b >= self.bands) {
            return Err(Error::Config(format!(
                "band {} requested but raster has {} bands",
                bad + 1,
                self.bands
            )));
        }
        let mut pixels = Vec::with_capacity(self.width * self.height * bands.len());
        for px in self.pixels.chunks_exact(self.bands.max(1)) {
            pixels.extend(bands.iter().map(|&b| px[b]));
        }
        Ok(RasterBuffer {
            pixels,
            width: self.width,
            height: self.height,
            bands: bands.len(),
            nodata: self.nodata,
        })
    }
}

impl PixelFetch for &RasterBuffer {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    fn fetch(&mut self, col: usize, row: usize, out: &mut [f32]) -> Result<()> {
        out.copy_from_slice(self.pixel(col, row));
        Ok(())
    }
}

/// Metadata of one GeoTIFF input, read from its tags without decoding pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSource {
    pub path: PathBuf,
    pub geo_transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub sample_type: SampleType,
    pub nodata: Option<f64>,
    pub epsg: Option<u32>,
}

impl RasterSource {
    /// Read the metadata of a GeoTIFF.
    ///
    /// # Errors
    /// Returns [`Error::SourceOpen`] if the file is unreadable, not a TIFF, or
    /// carries no georeferencing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut decoder = open_decoder(path)?;
        read_metadata(path, &mut decoder).map_err(|reason| Error::source_open(path, reason))
    }

    /// Bounding box in the source CRS
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        self.geo_transform.bounds(self.width, self.height)
    }

    #[must_use]
    pub fn needs_normalization(&self) -> bool {
        self.geo_transform.has_shear()
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| Error::source_open(path, e))?;
    Decoder::new(BufReader::new(file))
        .map(|d| d.with_limits(Limits::unlimited()))
        .map_err(|e| Error::source_open(path, e))
}

fn read_metadata(path: &Path, decoder: &mut Decoder<BufReader<File>>) -> std::result::Result<RasterSource, String> {
    let (width, height) = decoder.dimensions().map_err(|e| e.to_string())?;

    let bands = find_u32_vec(decoder, Tag::SamplesPerPixel)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let bits = find_u32_vec(decoder, Tag::BitsPerSample)?
        .and_then(|v| v.first().copied())
        .unwrap_or(8);
    let sample_format = find_u32_vec(decoder, Tag::SampleFormat)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let planar = find_u32_vec(decoder, Tag::PlanarConfiguration)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    if planar != 1 {
        return Err("band-separate (planar) layout is not supported".to_string());
    }

    let geo_transform = if let Some(matrix) = find_f64_vec(decoder, tag(GEOTIFF_MODELTRANSFORMATION))? {
        GeoTransform::from_model_transformation(&matrix)
    } else {
        match (
            find_f64_vec(decoder, tag(GEOTIFF_MODELPIXELSCALE))?,
            find_f64_vec(decoder, tag(GEOTIFF_MODELTIEPOINT))?,
        ) {
            (Some(scale), Some(tie)) => GeoTransform::from_scale_tiepoint(&scale, &tie),
            _ => None,
        }
    }
    .ok_or_else(|| "missing geotransform".to_string())?;

    let nodata = match decoder.find_tag(tag(GDAL_NODATA)).map_err(|e| e.to_string())? {
        Some(value) => value
            .into_string()
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok()),
        None => None,
    };

    let epsg = find_u32_vec(decoder, tag(GEOTIFF_GEOKEYDIRECTORY))?.and_then(|keys| epsg_from_geokeys(&keys));

    debug!(path = %path.display(), width, height, bands, ?epsg, "Read raster metadata");

    Ok(RasterSource {
        path: path.to_path_buf(),
        geo_transform,
        width: width as usize,
        height: height as usize,
        bands: bands as usize,
        sample_type: SampleType::from_tags(bits, sample_format),
        nodata,
        epsg,
    })
}

fn find_u32_vec(decoder: &mut Decoder<BufReader<File>>, t: Tag) -> std::result::Result<Option<Vec<u32>>, String> {
    match decoder.find_tag(t).map_err(|e| e.to_string())? {
        Some(value) => value.into_u32_vec().map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

fn find_f64_vec(decoder: &mut Decoder<BufReader<File>>, t: Tag) -> std::result::Result<Option<Vec<f64>>, String> {
    match decoder.find_tag(t).map_err(|e| e.to_string())? {
        Some(value) => value.into_f64_vec().map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

/// Pull the projected or geographic CRS code out of a GeoKeyDirectory.
///
/// Layout: 4-entry header, then `(key, location, count, value)` quads. Only
/// inline values (location 0) are considered.
#[must_use]
pub fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let mut geographic = None;
    for entry in keys.get(4..)?.chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value == 32767 {
            continue;
        }
        if key == u32::from(PROJECTED_CS_TYPE_GEO_KEY) {
            return Some(value);
        }
        if key == u32::from(GEOGRAPHIC_TYPE_GEO_KEY) {
            geographic = Some(value);
        }
    }
    geographic
}

/// Where and how the strips or tiles of a raster are stored.
#[derive(Debug, Clone)]
struct ChunkLayout {
    /// Chunk (strip or tile) size in pixels
    width: usize,
    height: usize,
    across: usize,
    tiled: bool,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    compression: u16,
    predictor: u16,
    bits: u16,
    sample_format: u16,
    big_endian: bool,
}

const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_DEFLATE: u16 = 8;
const COMPRESSION_DEFLATE_OLD: u16 = 32946;
const PREDICTOR_NONE: u16 = 1;
const PREDICTOR_HORIZONTAL: u16 = 2;

fn first_u16(decoder: &mut Decoder<BufReader<File>>, t: Tag, default: u16) -> std::result::Result<u16, String> {
    let value = find_u32_vec(decoder, t)?.and_then(|v| v.first().copied());
    match value {
        Some(v) => u16::try_from(v).map_err(|_| format!("{t:?} value {v} out of range")),
        None => Ok(default),
    }
}

fn find_u64_vec(decoder: &mut Decoder<BufReader<File>>, t: Tag) -> std::result::Result<Option<Vec<u64>>, String> {
    match decoder.find_tag(t).map_err(|e| e.to_string())? {
        Some(value) => value.into_u64_vec().map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

fn read_chunk_layout(
    decoder: &mut Decoder<BufReader<File>>,
    source: &RasterSource,
    big_endian: bool,
) -> std::result::Result<ChunkLayout, String> {
    let tile_width = find_u32_vec(decoder, Tag::TileWidth)?.and_then(|v| v.first().copied());
    let tile_length = find_u32_vec(decoder, Tag::TileLength)?.and_then(|v| v.first().copied());
    let (tiled, width, height, offsets_tag, counts_tag) = match (tile_width, tile_length) {
        (Some(w), Some(h)) => (true, w as usize, h as usize, Tag::TileOffsets, Tag::TileByteCounts),
        _ => {
            let rows = find_u32_vec(decoder, Tag::RowsPerStrip)?
                .and_then(|v| v.first().copied())
                .map_or(source.height, |r| r as usize);
            (false, source.width, rows.min(source.height), Tag::StripOffsets, Tag::StripByteCounts)
        }
    };
    let (width, height) = (width.max(1), height.max(1));
    let offsets = find_u64_vec(decoder, offsets_tag)?.ok_or_else(|| format!("missing {offsets_tag:?}"))?;
    let byte_counts = find_u64_vec(decoder, counts_tag)?.ok_or_else(|| format!("missing {counts_tag:?}"))?;
    if offsets.len() != byte_counts.len() {
        return Err(format!(
            "{} chunk offsets but {} byte counts",
            offsets.len(),
            byte_counts.len()
        ));
    }

    Ok(ChunkLayout {
        width,
        height,
        across: source.width.div_ceil(width),
        tiled,
        offsets,
        byte_counts,
        compression: first_u16(decoder, Tag::Compression, COMPRESSION_NONE)?,
        predictor: first_u16(decoder, Tag::Predictor, PREDICTOR_NONE)?,
        bits: first_u16(decoder, Tag::BitsPerSample, 8)?,
        sample_format: first_u16(decoder, Tag::SampleFormat, 1)?,
        big_endian,
    })
}

/// `true` for a big-endian (`MM`) file.
fn read_byte_order(path: &Path) -> Result<bool> {
    let mut header = [0u8; 2];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map_err(|e| Error::source_open(path, e))?;
    match &header {
        b"II" => Ok(false),
        b"MM" => Ok(true),
        _ => Err(Error::source_open(path, "not a TIFF file")),
    }
}

struct ReaderState {
    file: File,
    layout: ChunkLayout,
    /// Decoder for compressions not inflated natively, opened on first use
    fallback: Option<Decoder<BufReader<File>>>,
    cache: TileCache,
}

/// Open decoding handle on a [`RasterSource`].
///
/// Holds one file descriptor. The handle is `Send + Sync`; reads lock it for
/// the duration of a [`SourceReader::pixels`] session.
pub struct SourceReader {
    source: RasterSource,
    state: Mutex<ReaderState>,
}

impl SourceReader {
    /// Open a handle with the default chunk cache budget.
    ///
    /// # Errors
    /// Returns [`Error::SourceOpen`] if the file cannot be opened or parsed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_cache(path, DEFAULT_CAPACITY_BYTES)
    }

    /// Open a handle whose decoded-chunk cache holds at most `cache_bytes`.
    ///
    /// # Errors
    /// Returns [`Error::SourceOpen`] if the file cannot be opened or parsed.
    pub fn open_with_cache<P: AsRef<Path>>(path: P, cache_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        let big_endian = read_byte_order(path)?;
        let (source, layout) = {
            let mut decoder = open_decoder(path)?;
            let source = read_metadata(path, &mut decoder).map_err(|reason| Error::source_open(path, reason))?;
            let layout =
                read_chunk_layout(&mut decoder, &source, big_endian).map_err(|reason| Error::source_open(path, reason))?;
            (source, layout)
        };
        let file = File::open(path).map_err(|e| Error::source_open(path, e))?;
        Ok(Self {
            state: Mutex::new(ReaderState {
                file,
                layout,
                fallback: None,
                cache: TileCache::new(cache_bytes),
            }),
            source,
        })
    }

    #[must_use]
    pub fn source(&self) -> &RasterSource {
        &self.source
    }

    /// Start a pixel-access session holding the decoder lock.
    ///
    /// # Errors
    /// Returns [`Error::SourceOpen`] if a previous session panicked.
    pub fn pixels(&self) -> Result<SourcePixels<'_>> {
        let guard = self
            .state
            .lock()
            .map_err(|_| Error::source_open(&self.source.path, "decoder lock poisoned"))?;
        Ok(SourcePixels {
            source: &self.source,
            state: guard,
            current: None,
        })
    }

    /// Decode the whole raster into memory.
    ///
    /// # Errors
    /// Returns [`Error::SourceOpen`] if any chunk fails to decode.
    pub fn read_all(&self) -> Result<RasterBuffer> {
        let src = &self.source;
        let mut buffer = RasterBuffer::filled(src.width, src.height, src.bands, 0.0)
            .with_nodata(src.nodata.map(|v| v as f32));
        let mut access = self.pixels()?;
        for row in 0..src.height {
            for col in 0..src.width {
                access.fetch(col, row, buffer.pixel_mut(col, row))?;
            }
        }
        Ok(buffer)
    }
}

/// Locked view on a [`SourceReader`] used by the resampling kernels.
pub struct SourcePixels<'a> {
    source: &'a RasterSource,
    state: MutexGuard<'a, ReaderState>,
    /// Last chunk touched; scanline-order reads hit it almost every time
    current: Option<(u32, Arc<DecodedChunk>)>,
}

impl SourcePixels<'_> {
    fn chunk(&mut self, index: u32) -> Result<Arc<DecodedChunk>> {
        if let Some((cur, chunk)) = &self.current {
            if *cur == index {
                return Ok(Arc::clone(chunk));
            }
        }
        let chunk = if let Some(chunk) = self.state.cache.get(index) {
            chunk
        } else {
            let decoded = self
                .decode_chunk(index)
                .map_err(|reason| Error::source_open(&self.source.path, format!("chunk {index}: {reason}")))?;
            let chunk = Arc::new(decoded);
            self.state.cache.insert(index, Arc::clone(&chunk));
            chunk
        };
        self.current = Some((index, Arc::clone(&chunk)));
        Ok(chunk)
    }

    fn decode_chunk(&mut self, index: u32) -> std::result::Result<DecodedChunk, String> {
        let source = self.source;
        let bands = source.bands.max(1);
        let layout = &self.state.layout;
        let i = index as usize;
        let (&offset, &count) = layout
            .offsets
            .get(i)
            .zip(layout.byte_counts.get(i))
            .ok_or_else(|| format!("index beyond {} stored chunks", layout.offsets.len()))?;

        let rows = if layout.tiled {
            layout.height
        } else {
            layout.height.min(source.height.saturating_sub(i * layout.height))
        };
        let samples = layout.width * rows * bands;

        // Sparse chunk: nothing stored, reads as nodata
        if offset == 0 || count == 0 {
            #[allow(clippy::cast_possible_truncation)]
            let fill = source.nodata.unwrap_or(0.0) as f32;
            return Ok(DecodedChunk {
                data: vec![fill; samples],
                stride: layout.width,
            });
        }

        let inflate = match layout.compression {
            COMPRESSION_NONE => false,
            COMPRESSION_DEFLATE | COMPRESSION_DEFLATE_OLD => true,
            _ => return self.decode_with_fallback(index),
        };

        let layout = layout.clone();
        let len = usize::try_from(count).map_err(|_| "byte count overflow".to_string())?;
        let mut stored = vec![0u8; len];
        let file = &mut self.state.file;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut stored))
            .map_err(|e| e.to_string())?;

        let raw = if inflate {
            let mut out = Vec::with_capacity(samples * usize::from(layout.bits / 8));
            ZlibDecoder::new(stored.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| format!("inflate: {e}"))?;
            out
        } else {
            stored
        };

        let data = unpack_samples(&raw, samples, layout.width * bands, bands, &layout)?;
        Ok(DecodedChunk {
            data,
            stride: layout.width,
        })
    }

    /// Decode through the `tiff` decoder, for compressions such as LZW.
    fn decode_with_fallback(&mut self, index: u32) -> std::result::Result<DecodedChunk, String> {
        let source = self.source;
        let state = &mut *self.state;
        if state.fallback.is_none() {
            state.fallback = Some(open_decoder(&source.path).map_err(|e| e.to_string())?);
        }
        let result = state
            .fallback
            .as_mut()
            .ok_or_else(|| "decoder unavailable".to_string())?
            .read_chunk(index)
            .map_err(|e| e.to_string())?;
        let data = decoding_to_f32(result)?;

        let layout = &state.layout;
        let col = index as usize % layout.across;
        let data_width = layout.width.min(source.width - col * layout.width);
        let bands = source.bands.max(1);
        // Edge tiles may come back padded to the full tile size or clipped
        let stride = if data.len() == layout.width * layout.height * bands {
            layout.width
        } else {
            data_width
        };
        Ok(DecodedChunk { data, stride })
    }
}

/// Convert stored bytes into `samples` f32 values, undoing the horizontal
/// predictor on rows of `row_len` samples.
// Allow precision loss: integer samples wider than 24 bits are rare in imagery
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn unpack_samples(
    raw: &[u8],
    samples: usize,
    row_len: usize,
    bands: usize,
    layout: &ChunkLayout,
) -> std::result::Result<Vec<f32>, String> {
    let size = usize::from(layout.bits / 8);
    if !matches!(layout.bits, 8 | 16 | 32 | 64) {
        return Err(format!("{} bits per sample is unsupported", layout.bits));
    }
    if raw.len() < samples * size {
        return Err(format!("expected {} bytes, got {}", samples * size, raw.len()));
    }

    let mut words: Vec<u64> = raw[..samples * size]
        .chunks_exact(size)
        .map(|b| {
            let mut buf = [0u8; 8];
            if layout.big_endian {
                buf[8 - size..].copy_from_slice(b);
                u64::from_be_bytes(buf)
            } else {
                buf[..size].copy_from_slice(b);
                u64::from_le_bytes(buf)
            }
        })
        .collect();

    match (layout.predictor, layout.sample_format) {
        (PREDICTOR_NONE, _) => {}
        (PREDICTOR_HORIZONTAL, 1 | 2) => {
            let mask = if size == 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
            for row in words.chunks_mut(row_len.max(1)) {
                for i in bands..row.len() {
                    row[i] = row[i].wrapping_add(row[i - bands]) & mask;
                }
            }
        }
        (p, _) => return Err(format!("predictor {p} is unsupported")),
    }

    let convert: fn(u64) -> f32 = match (layout.sample_format, layout.bits) {
        (1, _) => |w| w as f32,
        (2, 8) => |w| f32::from(w as u8 as i8),
        (2, 16) => |w| f32::from(w as u16 as i16),
        (2, 32) => |w| w as u32 as i32 as f32,
        (2, 64) => |w| w as i64 as f32,
        (3, 32) => |w| f32::from_bits(w as u32),
        (3, 64) => |w| f64::from_bits(w) as f32,
        (format, bits) => return Err(format!("sample format {format} with {bits} bits is unsupported")),
    };
    Ok(words.into_iter().map(convert).collect())
}

impl PixelFetch for SourcePixels<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.source.width, self.source.height)
    }

    fn band_count(&self) -> usize {
        self.source.bands
    }

    fn nodata(&self) -> Option<f32> {
        // Allow truncation: nodata sentinels are representable in the sample type
        #[allow(clippy::cast_possible_truncation)]
        self.source.nodata.map(|v| v as f32)
    }

    fn fetch(&mut self, col: usize, row: usize, out: &mut [f32]) -> Result<()> {
        let (cw, ch, across) = (self.state.layout.width, self.state.layout.height, self.state.layout.across);
        let index = (row / ch) * across + col / cw;
        let index = u32::try_from(index).map_err(|_| Error::source_open(&self.source.path, "chunk index overflow"))?;
        let chunk = self.chunk(index)?;
        let bands = self.source.bands;
        let start = ((row % ch) * chunk.stride + col % cw) * bands;
        let samples = chunk.data.get(start..start + bands).ok_or_else(|| {
            Error::source_open(&self.source.path, format!("pixel ({col}, {row}) outside decoded chunk {index}"))
        })?;
        out.copy_from_slice(samples);
        Ok(())
    }
}

// Allow precision loss: integer samples wider than 24 bits are rare in imagery
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn decoding_to_f32(result: DecodingResult) -> std::result::Result<Vec<f32>, String> {
    Ok(match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => return Err("unsupported sample type".to_string()),
    })
}
