use crate::io::catalog::ProductIdentifier;
use crate::io::raster::{read_band, BandRaster};
use crate::types::{Band, BandMosaics, GeoTransform, MosaicRaster, NdviError, NdviResult};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Locate the single raster for `band` inside an extracted product folder.
///
/// Layout: `<root>/GRANULE/<granule>/IMG_DATA/<name>_<band code>.jp2`
pub fn find_band_file(root: &Path, band: Band) -> NdviResult<PathBuf> {
    let root_pattern = glob::Pattern::escape(&root.to_string_lossy());
    let pattern = format!("{}/GRANULE/*/IMG_DATA/*_{}.jp2", root_pattern, band.code());

    let entries = glob::glob(&pattern)
        .map_err(|e| NdviError::InvalidInput(format!("Bad band file pattern {}: {}", pattern, e)))?;

    let mut matches = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => matches.push(path),
            Err(e) => log::warn!("Unreadable entry while looking for {}: {}", band, e),
        }
    }

    if matches.len() != 1 {
        log::error!("{} candidates for {} under {}: {:?}", matches.len(), band, root.display(), matches);
        return Err(NdviError::BandLookup {
            root: root.to_path_buf(),
            band,
            matches: matches.len(),
        });
    }

    Ok(matches.remove(0))
}

fn is_valid(value: f32, nodata: Option<f64>) -> bool {
    if value.is_nan() {
        return false;
    }
    match nodata {
        Some(nd) => value as f64 != nd,
        None => true,
    }
}

fn same_spacing(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

/// Whole-pixel offset of `origin` from `reference`, if the grids line up
fn pixel_offset(origin: f64, reference: f64, spacing: f64) -> Option<usize> {
    let offset = (origin - reference) / spacing;
    let whole = offset.round();
    if (offset - whole).abs() > 1e-6 || whole < 0.0 {
        return None;
    }
    Some(whole as usize)
}

/// Merge same-band rasters on the first raster's pixel grid.
///
/// The output starts out empty (nodata, or 0 without one) and each pixel
/// takes the first valid value found walking the inputs in order.
pub fn merge_rasters(band: Band, rasters: Vec<BandRaster>) -> NdviResult<MosaicRaster> {
    let mut rasters = rasters;
    if rasters.is_empty() {
        return Err(NdviError::InvalidInput(format!("No {} rasters to merge", band)));
    }

    if rasters.len() == 1 {
        let single = rasters.remove(0);
        log::info!("Single {} raster, no merge needed", band);
        return Ok(MosaicRaster {
            band,
            data: single.data,
            transform: single.transform,
            nodata: single.nodata,
        });
    }

    let reference = rasters[0].transform;
    let (px, py) = (reference.pixel_width, reference.pixel_height);
    if px <= 0.0 || py >= 0.0 {
        return Err(NdviError::Processing(format!(
            "Expected north-up rasters with negative pixel height, got {}x{}",
            px, py
        )));
    }

    let mut left = f64::INFINITY;
    let mut right = f64::NEG_INFINITY;
    let mut top = f64::NEG_INFINITY;
    let mut bottom = f64::INFINITY;

    for raster in &rasters {
        let gt = &raster.transform;
        if !gt.is_north_up() || !same_spacing(gt.pixel_width, px) || !same_spacing(gt.pixel_height, py) {
            return Err(NdviError::Processing(format!(
                "Cannot merge {} rasters on different grids: {:?} vs {:?}",
                band, gt, reference
            )));
        }
        let (rows, cols) = raster.data.dim();
        left = left.min(gt.top_left_x);
        right = right.max(gt.top_left_x + cols as f64 * px);
        top = top.max(gt.top_left_y);
        bottom = bottom.min(gt.top_left_y + rows as f64 * py);
    }

    let out_cols = ((right - left) / px).round() as usize;
    let out_rows = ((bottom - top) / py).round() as usize;
    let nodata = rasters[0].nodata;
    let fill = nodata.unwrap_or(0.0) as f32;

    log::info!(
        "Merging {} {} rasters into {}x{} mosaic",
        rasters.len(),
        band,
        out_cols,
        out_rows
    );

    let mut data = Array2::from_elem((out_rows, out_cols), fill);
    let mut filled = Array2::from_elem((out_rows, out_cols), false);

    let mut offsets = Vec::with_capacity(rasters.len());
    for raster in &rasters {
        let row_offset = pixel_offset(raster.transform.top_left_y, top, py);
        let col_offset = pixel_offset(raster.transform.top_left_x, left, px);
        match (row_offset, col_offset) {
            (Some(row), Some(col)) => offsets.push((row, col)),
            _ => {
                return Err(NdviError::Processing(format!(
                    "{} raster at ({}, {}) is not aligned with the {}x{} pixel grid",
                    band, raster.transform.top_left_x, raster.transform.top_left_y, px, py
                )))
            }
        }
    }

    for (raster, (row_offset, col_offset)) in rasters.iter().zip(offsets) {

        for ((row, col), &value) in raster.data.indexed_iter() {
            if !is_valid(value, raster.nodata) {
                continue;
            }
            let (out_row, out_col) = (row_offset + row, col_offset + col);
            if out_row >= out_rows || out_col >= out_cols || filled[[out_row, out_col]] {
                continue;
            }
            data[[out_row, out_col]] = value;
            filled[[out_row, out_col]] = true;
        }
    }

    Ok(MosaicRaster {
        band,
        data,
        transform: GeoTransform::north_up(left, top, px, py),
        nodata,
    })
}

/// Builds the red and near-infrared mosaics from extracted products
#[derive(Debug, Default, Clone, Copy)]
pub struct BandMosaicker;

impl BandMosaicker {
    pub fn new() -> Self {
        Self
    }

    /// Every product whose name carries a UTM zone must be in `working_crs`
    fn check_working_crs(roots: &[PathBuf], working_crs: &str) -> NdviResult<()> {
        let outside: Vec<String> = roots
            .iter()
            .filter_map(|root| match ProductIdentifier::from_path(root) {
                Ok(id) if id.crs() != working_crs => {
                    Some(format!("{} (zone {})", root.display(), id.utm_zone))
                }
                _ => None,
            })
            .collect();

        if outside.is_empty() {
            return Ok(());
        }
        log::error!("{} products outside working CRS {}", outside.len(), working_crs);
        Err(NdviError::InvalidInput(format!(
            "products not in working CRS {}: {}",
            working_crs,
            outside.join(", ")
        )))
    }

    /// Mosaic the red and near-infrared bands of every product in `roots`.
    ///
    /// Fails when a product lies in another UTM zone than `working_crs`.
    pub fn mosaic(&self, roots: &[PathBuf], working_crs: &str) -> NdviResult<BandMosaics> {
        Self::check_working_crs(roots, working_crs)?;
        if roots.is_empty() {
            return Err(NdviError::InvalidInput(
                "No extracted products to mosaic".to_string(),
            ));
        }

        let mut red_paths = Vec::with_capacity(roots.len());
        let mut nir_paths = Vec::with_capacity(roots.len());
        for root in roots {
            red_paths.push(find_band_file(root, Band::Red)?);
            nir_paths.push(find_band_file(root, Band::NearInfrared)?);
        }

        let red = merge_rasters(
            Band::Red,
            red_paths.iter().map(read_band).collect::<NdviResult<Vec<_>>>()?,
        )?;
        let nir = merge_rasters(
            Band::NearInfrared,
            nir_paths.iter().map(read_band).collect::<NdviResult<Vec<_>>>()?,
        )?;

        log::info!("mosaic done: red {}x{}, nir {}x{}", red.width(), red.height(), nir.width(), nir.height());
        Ok(BandMosaics { red, nir })
    }
}
