//! Working CRS selection and area-of-interest reprojection

use crate::types::{AreaOfInterest, NdviError, NdviResult, TileTable};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use geo::{Coord, LineString, Polygon};

/// WGS84 / UTM projection string for a zone (northern hemisphere convention)
pub fn utm_crs(zone: u8) -> String {
    format!(
        "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs +type=crs",
        zone
    )
}

/// Pick the CRS covering the largest summed tile area.
///
/// Ties go to the CRS encountered first in table order.
pub fn select_working_crs(table: &TileTable) -> NdviResult<String> {
    let mut totals: Vec<(&str, f64)> = Vec::new();

    for record in table {
        match totals.iter_mut().find(|(crs, _)| *crs == record.crs) {
            Some((_, total)) => *total += record.area,
            None => totals.push((record.crs.as_str(), record.area)),
        }
    }

    let mut best: Option<(&str, f64)> = None;
    for (crs, total) in totals {
        log::debug!("CRS {} covers {:.6} (summed footprint area)", crs, total);
        match best {
            Some((_, best_total)) if total <= best_total => {}
            _ => best = Some((crs, total)),
        }
    }

    let (crs, total) = best.ok_or_else(|| {
        NdviError::InvalidInput("cannot choose a working CRS from an empty tile table".to_string())
    })?;

    log::info!("Selected working CRS {} (summed area {:.6})", crs, total);
    Ok(crs.to_string())
}

/// Spatial reference with x = easting/longitude, y = northing/latitude
fn gis_ordered(definition: &str) -> NdviResult<SpatialRef> {
    let srs = SpatialRef::from_definition(definition)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Whether a CRS definition and a raster's WKT describe the same system
pub fn same_crs(definition: &str, wkt: &str) -> NdviResult<bool> {
    let a = SpatialRef::from_definition(definition)?;
    let b = SpatialRef::from_wkt(wkt)?;
    if a == b {
        return Ok(true);
    }
    // GeoTIFF round trips may rename a proj-string CRS to its EPSG equivalent
    match (a.to_proj4(), b.to_proj4()) {
        (Ok(pa), Ok(pb)) => Ok(pa.trim() == pb.trim()),
        _ => Ok(false),
    }
}

fn transform_ring(ring: &LineString<f64>, transform: &CoordTransform) -> NdviResult<LineString<f64>> {
    let mut xs: Vec<f64> = ring.coords().map(|c| c.x).collect();
    let mut ys: Vec<f64> = ring.coords().map(|c| c.y).collect();
    let mut zs = vec![0.0; xs.len()];

    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    Ok(xs
        .into_iter()
        .zip(ys)
        .map(|(x, y)| Coord { x, y })
        .collect::<Vec<_>>()
        .into())
}

impl AreaOfInterest {
    /// Same region expressed in `target_crs`; the original is left untouched
    pub fn reproject(&self, target_crs: &str) -> NdviResult<AreaOfInterest> {
        if self.crs() == target_crs {
            return Ok(self.clone());
        }

        log::info!("Reprojecting area of interest from {} to {}", self.crs(), target_crs);

        let source = gis_ordered(self.crs())?;
        let target = gis_ordered(target_crs)?;
        let transform = CoordTransform::new(&source, &target)?;

        let exterior = transform_ring(self.polygon().exterior(), &transform)?;
        let interiors = self
            .polygon()
            .interiors()
            .iter()
            .map(|ring| transform_ring(ring, &transform))
            .collect::<NdviResult<Vec<_>>>()?;

        AreaOfInterest::new(Polygon::new(exterior, interiors), target_crs)
    }
}
