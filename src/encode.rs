//! Full-resolution encoding of one chunk window.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::GeoTransform;
use crate::geotiff_writer::{GeoTiffCompression, GeoTiffWriter, RegionSource};
use crate::mosaic::Composite;
use crate::plan::ChunkWindow;
use crate::raster::RasterBuffer;
use crate::resample::{Region, ResamplingMethod};

/// Output raster parameters shared by every chunk of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    /// Method used to build overview levels
    pub resampling: ResamplingMethod,
    pub overview_count: usize,
    pub compression: GeoTiffCompression,
    /// Internal tile edge in pixels
    pub block_size: usize,
    pub nodata: f64,
    /// CRS assigned to the output
    pub target_epsg: u32,
    /// 1-based composite bands to keep, in output order
    pub bands: Vec<usize>,
    pub big_tiff: bool,
    pub sparse: bool,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            resampling: ResamplingMethod::Bilinear,
            overview_count: 8,
            compression: GeoTiffCompression::Deflate,
            block_size: 512,
            nodata: 0.0,
            target_epsg: 6539,
            bands: vec![1, 2, 3],
            big_tiff: true,
            sparse: true,
        }
    }
}

/// A chunk written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub window: ChunkWindow,
    pub path: PathBuf,
    pub overview_count: usize,
    /// File size
    pub bytes: u64,
}

/// Window of a composite restricted to a band subset.
struct ChunkView<'a> {
    composite: &'a Composite,
    window: ChunkWindow,
    /// 0-based
    bands: Vec<usize>,
}

impl RegionSource for ChunkView<'_> {
    fn read_region(
        &self,
        region: Region,
        out_width: usize,
        out_height: usize,
        method: ResamplingMethod,
    ) -> Result<RasterBuffer> {
        // Allow cast precision loss: offsets stay far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let shifted = Region::new(
            region.x + self.window.x_offset as f64,
            region.y + self.window.y_offset as f64,
            region.width,
            region.height,
        );
        self.composite
            .read_region(shifted, out_width, out_height, method)?
            .select_bands(&self.bands)
    }
}

/// Encode `window` of `composite` to `output_path`.
///
/// Pixels are pulled tile by tile; the file appears at `output_path` only once
/// it is complete.
///
/// # Errors
/// Returns [`Error::ChunkEncode`] for this window on any failure; nothing is
/// left at `output_path` in that case.
pub fn encode(
    composite: &Composite,
    window: ChunkWindow,
    output_path: &Path,
    params: &EncodeParams,
) -> Result<EncodedChunk> {
    let encode_err = |reason: String| Error::ChunkEncode { window, reason };

    let bands = params
        .bands
        .iter()
        .map(|&b| {
            if b == 0 || b > composite.bands() {
                Err(encode_err(format!(
                    "band {b} requested but composite has {} bands",
                    composite.bands()
                )))
            } else {
                Ok(b - 1)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    if bands.is_empty() {
        return Err(encode_err("empty band subset".to_string()));
    }

    let gt = composite.geo_transform();
    // Allow cast precision loss: offsets stay far below 2^52
    #[allow(clippy::cast_precision_loss)]
    let (origin_x, origin_y) = gt.apply(window.x_offset as f64, window.y_offset as f64);
    let (px, py) = gt.pixel_size();
    let chunk_gt = GeoTransform::north_up(origin_x, origin_y, px, py);

    let view = ChunkView {
        composite,
        window,
        bands,
    };
    let writer = GeoTiffWriter::new(window.x_size, window.y_size, view.bands.len(), composite.sample_type(), chunk_gt)
        .epsg(Some(params.target_epsg))
        .nodata(Some(params.nodata))
        .compression(params.compression)
        .block_size(params.block_size)
        .overviews(params.overview_count, params.resampling)
        .sparse(params.sparse)
        .big_tiff(params.big_tiff);

    let dir = output_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".chunk_{}_{}_", window.x_offset, window.y_offset))
        .suffix(".tif.tmp")
        .tempfile_in(dir)
        .map_err(|e| encode_err(format!("creating temp file: {e}")))?;
    let report = {
        let mut out = BufWriter::new(tmp.as_file_mut());
        let report = writer.write_to(&mut out, &view).map_err(|e| encode_err(e.to_string()))?;
        out.flush().map_err(|e| encode_err(e.to_string()))?;
        report
    };
    let file = tmp
        .persist(output_path)
        .map_err(|e| encode_err(format!("persisting {}: {}", output_path.display(), e.error)))?;
    let bytes = file
        .metadata()
        .map_err(|e| encode_err(e.to_string()))?
        .len();

    debug!(
        %window,
        path = %output_path.display(),
        bytes,
        tiles_written = report.tiles_written,
        tiles_omitted = report.tiles_omitted,
        "Encoded chunk"
    );

    Ok(EncodedChunk {
        window,
        path: output_path.to_path_buf(),
        overview_count: report.overview_count,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mosaic::build;
    use crate::raster::{RasterSource, SampleType};
    use tempfile::TempDir;
    use tiff::decoder::Decoder;
    use tiff::tags::Tag;

    fn composite(dir: &Path, bands: usize) -> Composite {
        let mut raster = RasterBuffer::filled(96, 64, bands, 0.0);
        for y in 0..32 {
            for x in 0..32 {
                for b in 0..bands {
                    raster.set(x, y, b, (10 * (b + 1)) as f32);
                }
            }
        }
        let path = dir.join("src.tif");
        GeoTiffWriter::new(96, 64, bands, SampleType::U8, GeoTransform::north_up(1000.0, 2000.0, 2.0, 2.0))
            .block_size(32)
            .write_buffer(&path, &raster)
            .unwrap();
        build(&[RasterSource::open(&path).unwrap()], &dir.join("output.vrt"), 0.0).unwrap()
    }

    fn params() -> EncodeParams {
        EncodeParams {
            block_size: 16,
            overview_count: 3,
            ..EncodeParams::default()
        }
    }

    fn count_levels(path: &Path) -> usize {
        let mut decoder = Decoder::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut levels = 1;
        while decoder.more_images() {
            decoder.next_image().unwrap();
            levels += 1;
        }
        levels
    }

    #[test]
    fn test_encode_writes_overviews_and_metadata() {
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let c = composite(dir.path(), 4);
        let window = ChunkWindow::new(0, 0, 48, 48);
        let path = window.output_path(out_dir.path());

        let chunk = encode(&c, window, &path, &params()).unwrap();
        assert_eq!(chunk.overview_count, 3);
        assert_eq!(chunk.path, path);
        assert_eq!(chunk.bytes, std::fs::metadata(&path).unwrap().len());
        assert_eq!(count_levels(&path), 4);

        let source = RasterSource::open(&path).unwrap();
        assert_eq!((source.width, source.height, source.bands), (48, 48, 3));
        assert_eq!(source.epsg, Some(6539));
        assert_eq!(source.nodata, Some(0.0));
        assert_eq!(source.geo_transform, GeoTransform::north_up(1000.0, 2000.0, 2.0, 2.0));
    }

    #[test]
    fn test_band_subset_and_window_offset() {
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let c = composite(dir.path(), 4);
        let window = ChunkWindow::new(16, 16, 32, 32);
        let path = window.output_path(out_dir.path());
        let p = EncodeParams {
            bands: vec![3, 1],
            sparse: false,
            ..params()
        };
        encode(&c, window, &path, &p).unwrap();

        let pixels = crate::raster::SourceReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(pixels.bands, 2);
        assert_eq!(pixels.pixel(0, 0), &[30.0, 10.0]);
        assert_eq!(pixels.pixel(31, 31), &[0.0, 0.0]);

        let source = RasterSource::open(&path).unwrap();
        assert_eq!(source.geo_transform.origin(), (1032.0, 1968.0));
    }

    #[test]
    fn test_sparse_tiles_are_omitted() {
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let c = composite(dir.path(), 3);
        // Data only in the top-left 32x32 of this 64x64 window
        let window = ChunkWindow::new(0, 0, 64, 64);
        let path = window.output_path(out_dir.path());
        let p = EncodeParams {
            overview_count: 0,
            ..params()
        };
        encode(&c, window, &path, &p).unwrap();

        let mut decoder = Decoder::new(std::fs::File::open(&path).unwrap()).unwrap();
        let counts = decoder.get_tag_u64_vec(Tag::TileByteCounts).unwrap();
        assert_eq!(counts.len(), 16);
        assert_eq!(counts.iter().filter(|&&c| c > 0).count(), 4);
    }

    #[test]
    fn test_invalid_band_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let c = composite(dir.path(), 3);
        let window = ChunkWindow::new(0, 0, 32, 32);
        let path = window.output_path(out_dir.path());
        let p = EncodeParams {
            bands: vec![1, 2, 4],
            ..params()
        };
        let err = encode(&c, window, &path, &p).unwrap_err();
        assert!(matches!(err, Error::ChunkEncode { window: w, .. } if w == window));
        assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let c = composite(dir.path(), 3);
        let window = ChunkWindow::new(0, 0, 32, 32);
        let path = window.output_path(out_dir.path());
        // Block size must be a multiple of 16
        let p = EncodeParams {
            block_size: 20,
            ..params()
        };
        assert!(encode(&c, window, &path, &p).is_err());
        assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());
    }
}
