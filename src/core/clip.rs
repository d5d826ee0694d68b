use crate::core::crs::same_crs;
use crate::core::ndvi::{OutputName, Stage};
use crate::io::raster::{read_band, write_float_raster, CrsSource};
use crate::types::{AreaOfInterest, GeoTransform, NdviError, NdviResult};
use geo::{Contains, Point};
use ndarray::{s, Array2, Axis};
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Pixel window `[row_start, row_end) x [col_start, col_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl PixelWindow {
    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }
}

/// Smallest window of a north-up grid covering the AOI bounds, clamped to
/// `rows x cols`. `None` when the AOI lies outside the grid.
pub fn aoi_window(
    aoi: &AreaOfInterest,
    transform: &GeoTransform,
    rows: usize,
    cols: usize,
) -> NdviResult<Option<PixelWindow>> {
    if !transform.is_north_up() || transform.pixel_width <= 0.0 || transform.pixel_height >= 0.0 {
        return Err(NdviError::Processing(format!(
            "Clipping needs a north-up raster, got {:?}",
            transform
        )));
    }

    let b = aoi.bounds();
    let col_from = ((b.min_x - transform.top_left_x) / transform.pixel_width).floor();
    let col_to = ((b.max_x - transform.top_left_x) / transform.pixel_width).ceil();
    let row_from = ((b.max_y - transform.top_left_y) / transform.pixel_height).floor();
    let row_to = ((b.min_y - transform.top_left_y) / transform.pixel_height).ceil();

    let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64) as usize;
    let window = PixelWindow {
        row_start: clamp(row_from, rows),
        row_end: clamp(row_to, rows),
        col_start: clamp(col_from, cols),
        col_end: clamp(col_to, cols),
    };

    if window.height() == 0 || window.width() == 0 {
        return Ok(None);
    }
    Ok(Some(window))
}

/// Crop `data` to `window` and blank every pixel whose centre is not inside
/// the AOI polygon. Returns the cropped data and its transform.
pub fn mask_to_aoi(
    data: &Array2<f32>,
    transform: &GeoTransform,
    window: PixelWindow,
    aoi: &AreaOfInterest,
) -> (Array2<f32>, GeoTransform) {
    let mut clipped = data
        .slice(s![window.row_start..window.row_end, window.col_start..window.col_end])
        .to_owned();
    let clipped_transform = transform.shifted(window.row_start, window.col_start);
    let polygon = aoi.polygon();

    let mask_row = |row: usize, mut values: ndarray::ArrayViewMut1<f32>| {
        for (col, value) in values.iter_mut().enumerate() {
            let (x, y) = clipped_transform.pixel_center(row, col);
            if !polygon.contains(&Point::new(x, y)) {
                *value = f32::NAN;
            }
        }
    };

    #[cfg(feature = "parallel")]
    clipped
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, values)| mask_row(row, values));

    #[cfg(not(feature = "parallel"))]
    clipped
        .axis_iter_mut(Axis(0))
        .enumerate()
        .for_each(|(row, values)| mask_row(row, values));

    (clipped, clipped_transform)
}

/// Path of the clipped product next to `raster_path`, never the input itself
pub fn clipped_path(raster_path: &Path) -> PathBuf {
    let parent = raster_path.parent().unwrap_or_else(|| Path::new(""));
    match OutputName::parse(raster_path) {
        Some(name) if name.stage == Stage::Ndvi => {
            parent.join(name.with_stage(Stage::ClippedNdvi).file_name())
        }
        _ => {
            let stem = raster_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "raster".to_string());
            parent.join(format!("{}_clipped.tif", stem))
        }
    }
}

/// The area of interest must be expressed in the raster's CRS
fn check_same_crs(aoi: &AreaOfInterest, raster_wkt: Option<&str>, raster_path: &Path) -> NdviResult<()> {
    let Some(wkt) = raster_wkt.filter(|w| !w.trim().is_empty()) else {
        log::warn!("{} has no CRS, assuming it matches {}", raster_path.display(), aoi.crs());
        return Ok(());
    };
    if !same_crs(aoi.crs(), wkt)? {
        return Err(NdviError::InvalidInput(format!(
            "area of interest is in {} but {} is in another CRS",
            aoi.crs(),
            raster_path.display()
        )));
    }
    Ok(())
}

/// Crops rasters to the area of interest
#[derive(Debug, Default, Clone, Copy)]
pub struct AoiClipper;

impl AoiClipper {
    pub fn new() -> Self {
        Self
    }

    /// Clip the raster at `raster_path` to `aoi` (which must already be in the
    /// raster's CRS) and write it next to the input. Returns the written path.
    pub fn clip(&self, raster_path: &Path, aoi: &AreaOfInterest) -> NdviResult<PathBuf> {
        log::info!("Clipping {} to area of interest", raster_path.display());

        if OutputName::parse(raster_path).map(|n| n.stage) == Some(Stage::ClippedNdvi) {
            return Err(NdviError::InvalidInput(format!(
                "{} is already clipped",
                raster_path.display()
            )));
        }

        let source = read_band(raster_path)?;
        check_same_crs(aoi, source.crs_wkt.as_deref(), raster_path)?;
        let (rows, cols) = source.data.dim();

        let window = aoi_window(aoi, &source.transform, rows, cols)?.ok_or_else(|| {
            NdviError::Processing(format!(
                "Area of interest does not overlap {}",
                raster_path.display()
            ))
        })?;
        log::debug!("Clip window {:?} of {}x{}", window, cols, rows);

        let (clipped, transform) = mask_to_aoi(&source.data, &source.transform, window, aoi);

        let output = clipped_path(raster_path);
        let crs = source.crs_wkt.as_deref().map(CrsSource::Wkt);
        write_float_raster(&output, &clipped, &transform, crs, Some(f64::NAN))?;

        log::info!(
            "Clipped {}x{} -> {}x{}, written to {}",
            cols,
            rows,
            window.width(),
            window.height(),
            output.display()
        );
        Ok(output)
    }
}
