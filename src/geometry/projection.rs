//! EPSG lookups and point projection using pure Rust (proj4rs + crs-definitions).

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::BoundingBox;
use crate::error::{Error, Result};

/// Get PROJ4 string for an EPSG code using the crs-definitions database
#[inline]
#[must_use]
pub fn get_proj_string(epsg: u32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: u32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        // Fallback: assume 4326 and similar are geographic
        (4000..5000).contains(&epsg)
    }
}

/// Project a point from one CRS to another.
///
/// # Errors
/// Returns [`Error::Projection`] if either code is unknown or the transform fails.
pub fn project_point(source_epsg: u32, target_epsg: u32, x: f64, y: f64) -> Result<(f64, f64)> {
    if source_epsg == target_epsg {
        return Ok((x, y));
    }

    let source_proj = load_proj(source_epsg)?;
    let target_proj = load_proj(target_epsg)?;

    // proj4rs uses radians for geographic coordinates
    let (x_in, y_in) = if is_geographic_crs(source_epsg) {
        (x.to_radians(), y.to_radians())
    } else {
        (x, y)
    };

    let mut point = (x_in, y_in, 0.0);
    transform(&source_proj, &target_proj, &mut point).map_err(|e| {
        Error::Projection(format!(
            "transform from EPSG:{source_epsg} to EPSG:{target_epsg} failed: {e:?}"
        ))
    })?;

    if is_geographic_crs(target_epsg) {
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    } else {
        Ok((point.0, point.1))
    }
}

/// Project the four corners of a box and return their envelope.
///
/// # Errors
/// Returns [`Error::Projection`] if any corner fails to project.
pub fn project_bounds(bounds: &BoundingBox, source_epsg: u32, target_epsg: u32) -> Result<BoundingBox> {
    let corners = [
        (bounds.minx, bounds.miny),
        (bounds.maxx, bounds.miny),
        (bounds.minx, bounds.maxy),
        (bounds.maxx, bounds.maxy),
    ];
    let projected = corners
        .iter()
        .map(|&(x, y)| project_point(source_epsg, target_epsg, x, y))
        .collect::<Result<Vec<_>>>()?;
    BoundingBox::from_points(projected)
        .ok_or_else(|| Error::Projection("no corners to project".to_string()))
}

fn load_proj(epsg: u32) -> Result<Proj> {
    let proj_str = get_proj_string(epsg).ok_or_else(|| {
        Error::Projection(format!("EPSG:{epsg} is not in the crs-definitions database"))
    })?;
    Proj::from_proj_string(proj_str)
        .map_err(|e| Error::Projection(format!("invalid projection EPSG:{epsg}: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_point_same_crs() {
        let (x, y) = project_point(6539, 6539, 1_000_000.0, 200_000.0).unwrap();
        assert_eq!((x, y), (1_000_000.0, 200_000.0));
    }

    #[test]
    fn test_project_point_utm_roundtrip() {
        let (x, y) = project_point(4326, 32633, 15.0, 52.0).unwrap();
        assert!(x > 400_000.0 && x < 600_000.0, "UTM easting: {x}");
        let (lon, lat) = project_point(32633, 4326, x, y).unwrap();
        assert!((lon - 15.0).abs() < 1e-5);
        assert!((lat - 52.0).abs() < 1e-5);
    }

    #[test]
    fn test_project_bounds_to_wgs84() {
        let utm = BoundingBox::new(500_000.0, 5_700_000.0, 510_000.0, 5_710_000.0);
        let wgs84 = project_bounds(&utm, 32633, 4326).unwrap();
        assert!(wgs84.minx > 14.0 && wgs84.maxx < 16.0);
        assert!(wgs84.miny > 51.0 && wgs84.maxy < 52.0);
    }

    #[test]
    fn test_unsupported_epsg_code() {
        let err = project_point(4326, 999_999, 0.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("not in the crs-definitions database"));
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(4326));
        assert!(!is_geographic_crs(3857));
        assert!(!is_geographic_crs(32633));
    }
}
