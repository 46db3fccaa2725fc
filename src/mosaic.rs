//! Virtual mosaic over a list of axis-aligned sources.
//!
//! [`build`] computes the union grid and persists it as a small XML manifest
//! (VRT-flavoured) without copying any pixels. [`Composite::open`] re-reads
//! that manifest into a view of its own, which is how every worker gets an
//! isolated mosaic. [`SourceReader`] handles are opened only for sources a
//! read overlaps and are pooled per composite.
//!
//! Reads resolve composite pixels back into each source through the two
//! geotransforms. Later sources are drawn over earlier ones; samples equal to
//! a source's declared nodata are transparent, letting earlier sources show
//! through.

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::geometry::projection::project_bounds;
use crate::geometry::{BoundingBox, GeoTransform};
use crate::geotiff_writer::RegionSource;
use crate::raster::{RasterBuffer, RasterSource, SampleType, SourceReader};
use crate::resample::{sample, Region, ResamplingMethod, SampleScratch};
use crate::tile_cache::DEFAULT_CAPACITY_BYTES;

/// Smallest per-handle share of the decoded-chunk budget.
const MIN_SOURCE_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Source handles a composite keeps open at once.
pub const DEFAULT_MAX_OPEN_SOURCES: usize = 64;

const WGS84: u32 = 4326;

/// Grid and source list of a mosaic, as stored in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicLayout {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub sample_type: SampleType,
    pub geo_transform: GeoTransform,
    pub epsg: Option<u32>,
    /// Value of composite pixels no source covers
    pub fill: f64,
    /// Sources in draw order (last on top)
    pub sources: Vec<RasterSource>,
}

impl MosaicLayout {
    /// Compute the union grid over `sources`.
    ///
    /// Pixel size is the mean of the sources' pixel sizes; the grid snaps the
    /// union extent to whole pixels.
    ///
    /// # Errors
    /// Returns [`Error::MosaicBuild`] for an empty list or a degenerate extent.
    pub fn from_sources(sources: &[RasterSource], fill: f64) -> Result<Self> {
        let first = sources
            .first()
            .ok_or_else(|| Error::MosaicBuild("no input sources".to_string()))?;

        let mut bounds = first.bounds();
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        for src in sources {
            if src.needs_normalization() {
                return Err(Error::MosaicBuild(format!(
                    "{} has a rotated geotransform; normalize it first",
                    src.path.display()
                )));
            }
            if src.bands != first.bands {
                warn!(
                    path = %src.path.display(),
                    bands = src.bands,
                    expected = first.bands,
                    "Source band count differs from first source"
                );
            }
            bounds = bounds.union(&src.bounds());
            let (px, py) = src.geo_transform.pixel_size();
            sum_x += px;
            sum_y += py;
        }
        // Allow cast precision loss: source counts are tiny
        #[allow(clippy::cast_precision_loss)]
        let n = sources.len() as f64;
        let (pixel_width, pixel_height) = (sum_x / n, sum_y / n);
        if !(pixel_width > 0.0 && pixel_height > 0.0) {
            return Err(Error::MosaicBuild("sources have zero pixel size".to_string()));
        }

        // Allow truncation: extents are positive and far below usize::MAX pixels
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (width, height) = (
            ((bounds.width() / pixel_width).round() as usize).max(1),
            ((bounds.height() / pixel_height).round() as usize).max(1),
        );

        let sample_type = if sources.iter().any(|s| s.sample_type == SampleType::F32) {
            SampleType::F32
        } else if sources.iter().any(|s| s.sample_type == SampleType::U16) {
            SampleType::U16
        } else {
            SampleType::U8
        };

        Ok(Self {
            width,
            height,
            bands: first.bands,
            sample_type,
            geo_transform: GeoTransform::north_up(bounds.minx, bounds.maxy, pixel_width, pixel_height),
            epsg: sources.iter().find_map(|s| s.epsg),
            fill,
            sources: sources.to_vec(),
        })
    }

    /// World extent of the composite grid.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        self.geo_transform.bounds(self.width, self.height)
    }

    /// Serialize to manifest XML.
    ///
    /// # Errors
    /// Returns [`Error::Manifest`] if the XML writer fails.
    pub fn to_xml(&self, path: &Path) -> Result<String> {
        let xml_err = |e| Error::manifest(path, e);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut root = BytesStart::new("VRTDataset");
        root.push_attribute(("rasterXSize", self.width.to_string().as_str()));
        root.push_attribute(("rasterYSize", self.height.to_string().as_str()));
        root.push_attribute(("bands", self.bands.to_string().as_str()));
        root.push_attribute(("dataType", self.sample_type.as_str()));
        root.push_attribute(("fill", self.fill.to_string().as_str()));
        if let Some(epsg) = self.epsg {
            root.push_attribute(("epsg", epsg.to_string().as_str()));
        }
        writer.write_event(Event::Start(root)).map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("GeoTransform")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Text(BytesText::new(&self.geo_transform.to_manifest_string())))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("GeoTransform")))
            .map_err(xml_err)?;

        for src in &self.sources {
            let path_str = src.path.to_string_lossy();
            let mut el = BytesStart::new("Source");
            el.push_attribute(("path", path_str.as_ref()));
            el.push_attribute(("width", src.width.to_string().as_str()));
            el.push_attribute(("height", src.height.to_string().as_str()));
            el.push_attribute(("bands", src.bands.to_string().as_str()));
            el.push_attribute(("dataType", src.sample_type.as_str()));
            el.push_attribute(("geoTransform", src.geo_transform.to_manifest_string().as_str()));
            if let Some(nodata) = src.nodata {
                el.push_attribute(("nodata", nodata.to_string().as_str()));
            }
            if let Some(epsg) = src.epsg {
                el.push_attribute(("epsg", epsg.to_string().as_str()));
            }
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("VRTDataset")))
            .map_err(xml_err)?;
        String::from_utf8(writer.into_inner()).map_err(|e| Error::manifest(path, e))
    }

    /// Parse manifest XML produced by [`MosaicLayout::to_xml`].
    ///
    /// # Errors
    /// Returns [`Error::Manifest`] for malformed XML or missing attributes.
    pub fn from_xml(xml: &str, path: &Path) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut root: Option<HashMap<String, String>> = None;
        let mut geo_transform = None;
        let mut in_geo_transform = false;
        let mut sources = Vec::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"VRTDataset" => root = Some(attributes(&e, path)?),
                    b"GeoTransform" => in_geo_transform = true,
                    _ => {}
                },
                Ok(Event::Empty(e)) if e.name().as_ref() == b"Source" => {
                    sources.push(source_from_attributes(&attributes(&e, path)?, path)?);
                }
                Ok(Event::Text(e)) if in_geo_transform => {
                    let text = e.unescape().map_err(|e| Error::manifest(path, e))?;
                    geo_transform = Some(
                        GeoTransform::parse_manifest_string(&text)
                            .ok_or_else(|| Error::manifest(path, "malformed GeoTransform"))?,
                    );
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"GeoTransform" => in_geo_transform = false,
                Ok(Event::Eof) => break,
                Err(e) => return Err(Error::manifest(path, e)),
                _ => {}
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| Error::manifest(path, "missing VRTDataset element"))?;
        Ok(Self {
            width: required(&root, "rasterXSize", path)?,
            height: required(&root, "rasterYSize", path)?,
            bands: required(&root, "bands", path)?,
            sample_type: required(&root, "dataType", path)?,
            geo_transform: geo_transform.ok_or_else(|| Error::manifest(path, "missing GeoTransform"))?,
            epsg: optional(&root, "epsg", path)?,
            fill: required(&root, "fill", path)?,
            sources,
        })
    }
}

fn attributes(e: &BytesStart<'_>, path: &Path) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::manifest(path, e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(|e| Error::manifest(path, e))?;
        map.insert(key, value.to_string());
    }
    Ok(map)
}

fn required<T: std::str::FromStr>(attrs: &HashMap<String, String>, key: &str, path: &Path) -> Result<T> {
    optional(attrs, key, path)?.ok_or_else(|| Error::manifest(path, format!("missing attribute '{key}'")))
}

fn optional<T: std::str::FromStr>(attrs: &HashMap<String, String>, key: &str, path: &Path) -> Result<Option<T>> {
    attrs
        .get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| Error::manifest(path, format!("invalid value '{raw}' for '{key}'")))
        })
        .transpose()
}

fn source_from_attributes(attrs: &HashMap<String, String>, path: &Path) -> Result<RasterSource> {
    let gt_raw: String = required(attrs, "geoTransform", path)?;
    Ok(RasterSource {
        path: PathBuf::from(required::<String>(attrs, "path", path)?),
        geo_transform: GeoTransform::parse_manifest_string(&gt_raw)
            .ok_or_else(|| Error::manifest(path, format!("malformed source geoTransform '{gt_raw}'")))?,
        width: required(attrs, "width", path)?,
        height: required(attrs, "height", path)?,
        bands: required(attrs, "bands", path)?,
        sample_type: required(attrs, "dataType", path)?,
        nodata: optional(attrs, "nodata", path)?,
        epsg: optional(attrs, "epsg", path)?,
    })
}

/// Build the mosaic of `sources` and write its manifest to `manifest_path`.
///
/// # Errors
/// Returns [`Error::MosaicBuild`] for an empty source list,
/// [`Error::Manifest`]/[`Error::Io`] if the manifest cannot be written and
/// [`Error::SourceOpen`] if a source cannot be reopened.
pub fn build(sources: &[RasterSource], manifest_path: &Path, fill: f64) -> Result<Composite> {
    let layout = MosaicLayout::from_sources(sources, fill)?;
    let xml = layout.to_xml(manifest_path)?;
    fs::write(manifest_path, xml)?;
    info!(
        manifest = %manifest_path.display(),
        width = layout.width,
        height = layout.height,
        sources = layout.sources.len(),
        "Created mosaic manifest"
    );
    Ok(Composite::from_layout(layout, manifest_path.to_path_buf(), DEFAULT_CAPACITY_BYTES))
}

/// Open view on a mosaic.
///
/// Holds only source metadata. Decoding handles are opened when a read first
/// touches a source and kept in a bounded LRU pool, so the number of open
/// files stays at most [`Composite::max_open_sources`] however many sources
/// the mosaic lists.
pub struct Composite {
    layout: MosaicLayout,
    manifest_path: PathBuf,
    /// Decoded-chunk budget shared by the pooled handles
    cache_bytes: usize,
    reader_cache_bytes: usize,
    readers: Mutex<LruCache<usize, Arc<SourceReader>>>,
}

impl Composite {
    /// Open the mosaic described by a manifest.
    ///
    /// # Errors
    /// Returns [`Error::Manifest`] if the manifest is unreadable or malformed.
    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        Self::open_with_cache(manifest_path, DEFAULT_CAPACITY_BYTES)
    }

    /// Like [`Composite::open`], splitting `cache_bytes` across the pooled
    /// handles.
    ///
    /// # Errors
    /// See [`Composite::open`].
    pub fn open_with_cache<P: AsRef<Path>>(manifest_path: P, cache_bytes: usize) -> Result<Self> {
        let path = manifest_path.as_ref();
        let xml = fs::read_to_string(path).map_err(|e| Error::manifest(path, e))?;
        let layout = MosaicLayout::from_xml(&xml, path)?;
        Ok(Self::from_layout(layout, path.to_path_buf(), cache_bytes))
    }

    fn from_layout(layout: MosaicLayout, manifest_path: PathBuf, cache_bytes: usize) -> Self {
        debug!(manifest = %manifest_path.display(), sources = layout.sources.len(), "Opened composite");
        let mut composite = Self {
            layout,
            manifest_path,
            cache_bytes,
            reader_cache_bytes: 0,
            readers: Mutex::new(LruCache::new(NonZeroUsize::MIN)),
        };
        composite.set_pool(DEFAULT_MAX_OPEN_SOURCES);
        composite
    }

    fn set_pool(&mut self, max_open: usize) {
        let slots = max_open.clamp(1, self.layout.sources.len().max(1));
        self.reader_cache_bytes = (self.cache_bytes / slots).max(MIN_SOURCE_CACHE_BYTES);
        let cap = NonZeroUsize::new(slots).unwrap_or(NonZeroUsize::MIN);
        self.readers = Mutex::new(LruCache::new(cap));
    }

    /// Cap the number of simultaneously open source handles.
    #[must_use]
    pub fn with_max_open_sources(mut self, max_open: usize) -> Self {
        self.set_pool(max_open);
        self
    }

    #[must_use]
    pub fn max_open_sources(&self) -> usize {
        self.readers.lock().map_or(1, |pool| pool.cap().get())
    }

    /// Number of source handles currently open.
    #[must_use]
    pub fn open_sources(&self) -> usize {
        self.readers.lock().map_or(0, |pool| pool.len())
    }

    /// Pooled handle for source `index`, opening it on a miss.
    fn reader(&self, index: usize) -> Result<Arc<SourceReader>> {
        let src = &self.layout.sources[index];
        let mut pool = self
            .readers
            .lock()
            .map_err(|_| Error::source_open(&src.path, "reader pool lock poisoned"))?;
        if let Some(reader) = pool.get(&index) {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(SourceReader::open_with_cache(&src.path, self.reader_cache_bytes)?);
        if let Some((evicted, _)) = pool.push(index, Arc::clone(&reader)) {
            trace!(evicted, opened = index, "Recycled source handle");
        }
        Ok(reader)
    }

    #[must_use]
    pub fn layout(&self) -> &MosaicLayout {
        &self.layout
    }

    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.layout.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.layout.height
    }

    #[must_use]
    pub fn bands(&self) -> usize {
        self.layout.bands
    }

    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.layout.sample_type
    }

    #[must_use]
    pub fn geo_transform(&self) -> GeoTransform {
        self.layout.geo_transform
    }

    #[must_use]
    pub fn fill(&self) -> f64 {
        self.layout.fill
    }

    /// Composite footprint in WGS84, when the sources declare a CRS.
    ///
    /// # Errors
    /// Returns [`Error::Projection`] if the CRS is unknown to the projection
    /// tables.
    pub fn bounds_wgs84(&self) -> Result<Option<BoundingBox>> {
        match self.layout.epsg {
            Some(WGS84) => Ok(Some(self.layout.bounds())),
            Some(epsg) => project_bounds(&self.layout.bounds(), epsg, WGS84).map(Some),
            None => Ok(None),
        }
    }
}

impl RegionSource for Composite {
    fn read_region(
        &self,
        region: Region,
        out_width: usize,
        out_height: usize,
        method: ResamplingMethod,
    ) -> Result<RasterBuffer> {
        let bands = self.layout.bands;
        // Allow truncation: fill is a sample-type sentinel
        #[allow(clippy::cast_possible_truncation)]
        let fill = self.layout.fill as f32;
        let mut out = RasterBuffer::filled(out_width, out_height, bands, fill).with_nodata(Some(fill));
        if out_width == 0 || out_height == 0 {
            return Ok(out);
        }

        let gt = self.layout.geo_transform;
        let region_bounds = BoundingBox::from_points([
            gt.apply(region.x, region.y),
            gt.apply(region.x + region.width, region.y + region.height),
        ])
        .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));
        let (comp_px, comp_py) = gt.pixel_size();
        // Allow cast precision loss: output grids stay far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let (step_x, step_y) = (region.width / out_width as f64, region.height / out_height as f64);

        let mut covered = vec![false; out_width * out_height];
        let mut scratch = SampleScratch::default();

        // Topmost source first; a pixel is settled by the first opaque hit
        for (index, src) in self.layout.sources.iter().enumerate().rev() {
            if !overlaps(&src.bounds(), &region_bounds) {
                continue;
            }
            let reader = self.reader(index)?;
            let Some(inverse) = src.geo_transform.invert() else {
                warn!(path = %src.path.display(), "Skipping source with singular geotransform");
                continue;
            };
            let (src_px, src_py) = src.geo_transform.pixel_size();
            let (fw, fh) = (step_x * comp_px / src_px, step_y * comp_py / src_py);
            let copy_bands = bands.min(src.bands);

            let mut pixels = reader.pixels()?;
            let mut value = vec![0.0_f32; src.bands];
            for oy in 0..out_height {
                #[allow(clippy::cast_precision_loss)]
                let cy = region.y + (oy as f64 + 0.5) * step_y;
                for ox in 0..out_width {
                    let idx = oy * out_width + ox;
                    if covered[idx] {
                        continue;
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let cx = region.x + (ox as f64 + 0.5) * step_x;
                    let (wx, wy) = gt.apply(cx, cy);
                    let (sx, sy) = inverse.apply(wx, wy);
                    if sample(&mut pixels, sx, sy, fw, fh, method, &mut scratch, &mut value)? {
                        out.pixel_mut(ox, oy)[..copy_bands].copy_from_slice(&value[..copy_bands]);
                        covered[idx] = true;
                    }
                }
            }
        }
        Ok(out)
    }
}

fn overlaps(a: &BoundingBox, b: &BoundingBox) -> bool {
    a.minx < b.maxx && b.minx < a.maxx && a.miny < b.maxy && b.miny < a.maxy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geotiff_writer::GeoTiffWriter;
    use tempfile::TempDir;

    fn write_source(dir: &Path, name: &str, gt: GeoTransform, raster: &RasterBuffer, nodata: Option<f64>) -> RasterSource {
        let path = dir.join(name);
        GeoTiffWriter::new(raster.width, raster.height, raster.bands, SampleType::U8, gt)
            .epsg(Some(32610))
            .nodata(nodata)
            .block_size(16)
            .write_buffer(&path, raster)
            .unwrap();
        RasterSource::open(&path).unwrap()
    }

    #[test]
    fn test_empty_source_list() {
        let dir = TempDir::new().unwrap();
        let err = build(&[], &dir.path().join("output.vrt"), 0.0).err().unwrap();
        assert!(matches!(err, Error::MosaicBuild(_)));
    }

    #[test]
    fn test_union_grid_and_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let a = write_source(
            dir.path(),
            "a.tif",
            GeoTransform::north_up(0.0, 64.0, 1.0, 1.0),
            &RasterBuffer::filled(32, 32, 3, 10.0),
            None,
        );
        let b = write_source(
            dir.path(),
            "b.tif",
            GeoTransform::north_up(32.0, 32.0, 1.0, 1.0),
            &RasterBuffer::filled(32, 32, 3, 20.0),
            None,
        );
        let manifest = dir.path().join("output.vrt");
        let composite = build(&[a, b], &manifest, 0.0).unwrap();
        assert_eq!((composite.width(), composite.height(), composite.bands()), (64, 64, 3));
        assert_eq!(composite.geo_transform(), GeoTransform::north_up(0.0, 64.0, 1.0, 1.0));

        let reopened = Composite::open(&manifest).unwrap();
        assert_eq!(reopened.layout(), composite.layout());
    }

    #[test]
    fn test_read_region_draws_later_sources_on_top() {
        let dir = TempDir::new().unwrap();
        let gt = GeoTransform::north_up(0.0, 16.0, 1.0, 1.0);
        let base = write_source(dir.path(), "base.tif", gt, &RasterBuffer::filled(16, 16, 1, 5.0), None);
        // Upper half transparent, lower half 9
        let mut top_raster = RasterBuffer::filled(16, 16, 1, 0.0);
        for y in 8..16 {
            for x in 0..16 {
                top_raster.set(x, y, 0, 9.0);
            }
        }
        let top = write_source(dir.path(), "top.tif", gt, &top_raster, Some(0.0));
        let composite = build(&[base, top], &dir.path().join("output.vrt"), 0.0).unwrap();

        let out = composite
            .read_region(Region::new(0.0, 0.0, 16.0, 16.0), 16, 16, ResamplingMethod::Nearest)
            .unwrap();
        assert_eq!(out.get(3, 2, 0), 5.0);
        assert_eq!(out.get(3, 12, 0), 9.0);
    }

    #[test]
    fn test_read_region_outside_sources_is_fill() {
        let dir = TempDir::new().unwrap();
        let a = write_source(
            dir.path(),
            "a.tif",
            GeoTransform::north_up(0.0, 32.0, 1.0, 1.0),
            &RasterBuffer::filled(16, 16, 1, 7.0),
            None,
        );
        let b = write_source(
            dir.path(),
            "b.tif",
            GeoTransform::north_up(16.0, 16.0, 1.0, 1.0),
            &RasterBuffer::filled(16, 16, 1, 7.0),
            None,
        );
        let composite = build(&[a, b], &dir.path().join("output.vrt"), 0.0).unwrap();
        // Top-right quadrant is not covered by either source
        let out = composite
            .read_region(Region::new(16.0, 0.0, 16.0, 16.0), 4, 4, ResamplingMethod::Bilinear)
            .unwrap();
        assert!(out.is_uniform(0.0));
        let covered = composite
            .read_region(Region::new(0.0, 0.0, 16.0, 16.0), 4, 4, ResamplingMethod::Average)
            .unwrap();
        assert!(covered.is_uniform(7.0));
    }

    #[test]
    fn test_many_sources_share_bounded_handle_pool() {
        let dir = TempDir::new().unwrap();
        // 20 x 15 grid of 16px tiles
        let sources: Vec<RasterSource> = (0..300)
            .map(|i| {
                let (col, row) = ((i % 20) as f64, (i / 20) as f64);
                let gt = GeoTransform::north_up(col * 16.0, 240.0 - row * 16.0, 1.0, 1.0);
                let value = (i % 250 + 1) as f32;
                write_source(dir.path(), &format!("s{i}.tif"), gt, &RasterBuffer::filled(16, 16, 1, value), None)
            })
            .collect();

        let manifest = dir.path().join("output.vrt");
        let built = build(&sources, &manifest, 0.0).unwrap();
        assert_eq!((built.width(), built.height()), (320, 240));
        assert_eq!(built.open_sources(), 0);

        let composite = Composite::open(&manifest).unwrap().with_max_open_sources(8);
        assert_eq!(composite.max_open_sources(), 8);
        assert_eq!(composite.open_sources(), 0);

        let out = composite
            .read_region(Region::new(0.0, 0.0, 320.0, 240.0), 320, 240, ResamplingMethod::Nearest)
            .unwrap();
        assert!(composite.open_sources() <= 8);
        for &(i, x, y) in &[(0usize, 0usize, 0usize), (21, 20, 16), (299, 319, 239), (137, 280, 100)] {
            assert_eq!(out.get(x, y, 0), (i % 250 + 1) as f32, "source {i}");
        }

        // A read touching one tile opens at most that tile
        let small = Composite::open(&manifest).unwrap();
        small
            .read_region(Region::new(1.0, 1.0, 8.0, 8.0), 8, 8, ResamplingMethod::Nearest)
            .unwrap();
        assert_eq!(small.open_sources(), 1);
    }

    #[test]
    fn test_missing_source_fails_on_read_not_open() {
        let dir = TempDir::new().unwrap();
        let a = write_source(
            dir.path(),
            "a.tif",
            GeoTransform::north_up(0.0, 16.0, 1.0, 1.0),
            &RasterBuffer::filled(16, 16, 1, 1.0),
            None,
        );
        let manifest = dir.path().join("output.vrt");
        build(&[a.clone()], &manifest, 0.0).unwrap();
        std::fs::remove_file(&a.path).unwrap();

        let composite = Composite::open(&manifest).unwrap();
        let err = composite
            .read_region(Region::new(0.0, 0.0, 16.0, 16.0), 4, 4, ResamplingMethod::Nearest)
            .unwrap_err();
        assert!(matches!(err, Error::SourceOpen { .. }));
    }

    #[test]
    fn test_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.vrt");
        std::fs::write(&path, "<VRTDataset rasterXSize=\"x\"></VRTDataset>").unwrap();
        assert!(matches!(Composite::open(&path), Err(Error::Manifest { .. })));
        assert!(matches!(
            Composite::open(dir.path().join("missing.vrt")),
            Err(Error::Manifest { .. })
        ));
    }

    #[test]
    fn test_bounds_wgs84() {
        let dir = TempDir::new().unwrap();
        let a = write_source(
            dir.path(),
            "a.tif",
            GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0, 10.0),
            &RasterBuffer::filled(16, 16, 1, 1.0),
            None,
        );
        let composite = build(&[a], &dir.path().join("output.vrt"), 0.0).unwrap();
        let wgs84 = composite.bounds_wgs84().unwrap().unwrap();
        // UTM zone 10N central meridian is -123
        assert!((wgs84.minx + 123.0).abs() < 0.1);
        assert!(wgs84.miny > 36.0 && wgs84.maxy < 37.0);
    }
}
