//! Affine georeferencing and world-space extents.

pub mod projection;

/// Bounding box in a coordinate reference system
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BoundingBox {
    /// Create a new bounding box
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Smallest box containing every point.
    ///
    /// Returns `None` for an empty iterator.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut bbox = Self::new(x0, y0, x0, y0);
        for (x, y) in iter {
            bbox.minx = bbox.minx.min(x);
            bbox.miny = bbox.miny.min(y);
            bbox.maxx = bbox.maxx.max(x);
            bbox.maxy = bbox.maxy.max(y);
        }
        Some(bbox)
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }
}

/// Affine pixel-to-world mapping in the usual six-coefficient layout:
///
/// ```text
/// X = c[0] + col * c[1] + row * c[2]
/// Y = c[3] + col * c[4] + row * c[5]
/// ```
///
/// `c[2]` and `c[4]` are the rotation (shear) terms. Sources can only be
/// mosaicked directly when both are zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform with square or rectangular pixels.
    #[must_use]
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height.abs()])
    }

    /// Build from a `ModelPixelScale` + `ModelTiepoint` tag pair.
    ///
    /// The tiepoint `(i, j, k, x, y, z)` maps raster point `(i, j)` to `(x, y)`.
    #[must_use]
    pub fn from_scale_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Option<Self> {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return None;
        }
        let (sx, sy) = (scale[0], scale[1]);
        let origin_x = tiepoint[3] - tiepoint[0] * sx;
        let origin_y = tiepoint[4] + tiepoint[1] * sy;
        Some(Self([origin_x, sx, 0.0, origin_y, 0.0, -sy]))
    }

    /// Build from a row-major 4x4 `ModelTransformation` matrix.
    #[must_use]
    pub fn from_model_transformation(matrix: &[f64]) -> Option<Self> {
        if matrix.len() < 8 {
            return None;
        }
        Some(Self([
            matrix[3], matrix[0], matrix[1], matrix[7], matrix[4], matrix[5],
        ]))
    }

    /// Row-major 4x4 `ModelTransformation` matrix for this transform.
    #[must_use]
    pub fn to_model_transformation(&self) -> [f64; 16] {
        let c = &self.0;
        [
            c[1], c[2], 0.0, c[0], //
            c[4], c[5], 0.0, c[3], //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    /// Whether either rotation term is nonzero.
    #[must_use]
    pub fn has_shear(&self) -> bool {
        self.0[2] != 0.0 || self.0[4] != 0.0
    }

    #[must_use]
    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    /// Ground size of one pixel along the column and row directions.
    ///
    /// For sheared transforms these are the lengths of the pixel edge vectors.
    #[must_use]
    pub fn pixel_size(&self) -> (f64, f64) {
        let c = &self.0;
        (c[1].hypot(c[4]), c[2].hypot(c[5]))
    }

    /// Map a (fractional) pixel position to world coordinates.
    #[inline]
    #[must_use]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.0;
        (c[0] + col * c[1] + row * c[2], c[3] + col * c[4] + row * c[5])
    }

    /// Inverse mapping, world to fractional pixel. `None` if singular.
    #[must_use]
    pub fn invert(&self) -> Option<GeoTransform> {
        let c = &self.0;
        let det = c[1] * c[5] - c[2] * c[4];
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = c[5] * inv_det;
        let b = -c[2] * inv_det;
        let d = -c[4] * inv_det;
        let e = c[1] * inv_det;
        Some(GeoTransform([
            -(a * c[0] + b * c[3]),
            a,
            b,
            -(d * c[0] + e * c[3]),
            d,
            e,
        ]))
    }

    /// World extent of a `width x height` raster under this transform.
    #[must_use]
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        // Allow cast precision loss: raster dimensions stay far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let (w, h) = (width as f64, height as f64);
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        // Four corners are always present
        BoundingBox::from_points(corners).unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0))
    }

    /// Comma-separated coefficients, as stored in the mosaic manifest.
    #[must_use]
    pub fn to_manifest_string(&self) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the form written by [`GeoTransform::to_manifest_string`].
    #[must_use]
    pub fn parse_manifest_string(s: &str) -> Option<Self> {
        let values: Vec<f64> = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        let coeffs: [f64; 6] = values.try_into().ok()?;
        Some(Self(coeffs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_scale_tiepoint_roundtrip() {
        let gt = GeoTransform::from_scale_tiepoint(&[10.0, 10.0, 0.0], &[0.0, 0.0, 0.0, 500_000.0, 4_000_000.0, 0.0])
            .unwrap();
        assert_eq!(gt, GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0, 10.0));
        assert!(!gt.has_shear());
    }

    #[test]
    fn test_tiepoint_not_at_origin() {
        let gt = GeoTransform::from_scale_tiepoint(&[2.0, 2.0], &[10.0, 5.0, 0.0, 100.0, 200.0, 0.0]).unwrap();
        let (x, y) = gt.apply(10.0, 5.0);
        assert!((x - 100.0).abs() < EPS);
        assert!((y - 200.0).abs() < EPS);
    }

    #[test]
    fn test_model_transformation_roundtrip() {
        let gt = GeoTransform([100.0, 0.8, 0.6, 200.0, 0.6, -0.8]);
        let matrix = gt.to_model_transformation();
        assert_eq!(GeoTransform::from_model_transformation(&matrix), Some(gt));
        assert!(gt.has_shear());
    }

    #[test]
    fn test_invert() {
        let gt = GeoTransform([100.0, 0.8, 0.6, 200.0, 0.6, -0.8]);
        let inv = gt.invert().unwrap();
        let (x, y) = gt.apply(13.0, 7.0);
        let (col, row) = inv.apply(x, y);
        assert!((col - 13.0).abs() < 1e-9);
        assert!((row - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_singular_transform_has_no_inverse() {
        assert!(GeoTransform([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).invert().is_none());
    }

    #[test]
    fn test_pixel_size_of_rotated_grid() {
        let gt = GeoTransform([0.0, 0.8, 0.6, 0.0, 0.6, -0.8]);
        let (sx, sy) = gt.pixel_size();
        assert!((sx - 1.0).abs() < EPS);
        assert!((sy - 1.0).abs() < EPS);
    }

    #[test]
    fn test_bounds_north_up() {
        let gt = GeoTransform::north_up(0.0, 100.0, 1.0, 1.0);
        let b = gt.bounds(50, 100);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 50.0, 100.0));
    }

    #[test]
    fn test_manifest_string_roundtrip() {
        let gt = GeoTransform([123.456, 0.1, 0.0, -45.5, 0.0, -0.1]);
        let parsed = GeoTransform::parse_manifest_string(&gt.to_manifest_string()).unwrap();
        assert_eq!(parsed, gt);
        assert!(GeoTransform::parse_manifest_string("1,2,3").is_none());
    }

    #[test]
    fn test_union() {
        let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let b = BoundingBox::new(2.0, -1.0, 3.0, 0.5);
        assert_eq!(a.union(&b), BoundingBox::new(0.0, -1.0, 3.0, 1.0));
    }
}
