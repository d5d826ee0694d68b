use chrono::{DateTime, Utc};
use geo::{BoundingRect, MultiPolygon, Polygon};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CRS of catalog footprints (geographic lon/lat)
pub const CATALOG_CRS: &str = "EPSG:4326";

/// Spectral bands used by the vegetation index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Red,
    NearInfrared,
}

impl Band {
    /// Sentinel-2 MSI band code
    pub fn code(&self) -> &'static str {
        match self {
            Band::Red => "B04",
            Band::NearInfrared => "B08",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Red => write!(f, "red ({})", self.code()),
            Band::NearInfrared => write!(f, "near-infrared ({})", self.code()),
        }
    }
}

/// Axis-aligned bounding box in the units of its CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Closed polygon tracing the box counter-clockwise
    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            vec![
                (self.max_x, self.min_y),
                (self.max_x, self.max_y),
                (self.min_x, self.max_y),
                (self.min_x, self.min_y),
                (self.max_x, self.min_y),
            ]
            .into(),
            vec![],
        )
    }
}

/// Geospatial transformation parameters (GDAL affine order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// World coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Same grid, origin moved to pixel (row, col)
    pub fn shifted(&self, row: usize, col: usize) -> Self {
        Self {
            top_left_x: self.top_left_x + col as f64 * self.pixel_width + row as f64 * self.rotation_x,
            top_left_y: self.top_left_y + col as f64 * self.rotation_y + row as f64 * self.pixel_height,
            ..*self
        }
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0
    }
}

/// Inclusive acquisition time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> NdviResult<Self> {
        if start > end {
            return Err(NdviError::InvalidInput(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Catalog range literal: `[start TO end]`
    pub fn to_query_range(&self) -> String {
        format!(
            "[{} TO {}]",
            self.start.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.end.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        )
    }
}

/// Region to study: one polygon plus the CRS its coordinates are in
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    polygon: Polygon<f64>,
    crs: String,
}

impl AreaOfInterest {
    pub fn new(polygon: Polygon<f64>, crs: impl Into<String>) -> NdviResult<Self> {
        if polygon.exterior().0.len() < 4 {
            return Err(NdviError::InvalidInput(
                "area of interest needs a closed ring with at least three vertices".to_string(),
            ));
        }
        Ok(Self {
            polygon,
            crs: crs.into(),
        })
    }

    /// Area of interest given in catalog (lon/lat) coordinates
    pub fn geographic(polygon: Polygon<f64>) -> NdviResult<Self> {
        Self::new(polygon, CATALOG_CRS)
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn bounds(&self) -> BoundingBox {
        // A validated ring always has a bounding rectangle
        let rect = self
            .polygon
            .bounding_rect()
            .unwrap_or_else(|| geo::Rect::new((0.0, 0.0), (0.0, 0.0)));
        BoundingBox {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        }
    }
}

/// One catalog tile that intersects the area of interest
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    pub tile_id: String,
    pub acquisition_date: DateTime<Utc>,
    pub tile_number: String,            // N<baseline>_R<orbit>_T<tile>
    pub link: String,                   // download URL
    pub footprint: MultiPolygon<f64>,
    pub area: f64,                      // planar, in footprint CRS units (deg²)
    pub cloud_cover_percentage: f64,
    pub crs: String,                    // native UTM CRS (proj string)
}

/// Ordered catalog result, footprints in `crs`
#[derive(Debug, Clone, PartialEq)]
pub struct TileTable {
    records: Vec<TileRecord>,
    crs: String,
}

impl Default for TileTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TileTable {
    pub fn new(records: Vec<TileRecord>) -> Self {
        Self {
            records,
            crs: CATALOG_CRS.to_string(),
        }
    }

    pub fn records(&self) -> &[TileRecord] {
        &self.records
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TileRecord> {
        self.records.iter()
    }

    /// Rows at the given positions, in the order given
    pub fn select(&self, rows: &[usize]) -> NdviResult<TileTable> {
        let mut records = Vec::with_capacity(rows.len());
        for &row in rows {
            let record = self.records.get(row).ok_or_else(|| {
                NdviError::InvalidInput(format!(
                    "row {} out of range for table of {} tiles",
                    row,
                    self.records.len()
                ))
            })?;
            records.push(record.clone());
        }
        Ok(TileTable {
            records,
            crs: self.crs.clone(),
        })
    }

    pub fn retain_max_cloud_cover(mut self, max_percentage: f64) -> TileTable {
        self.records
            .retain(|r| r.cloud_cover_percentage <= max_percentage);
        self
    }

    /// Stable sort, clearest tiles first
    pub fn sorted_by_cloud_cover(mut self) -> TileTable {
        self.records.sort_by(|a, b| {
            a.cloud_cover_percentage
                .total_cmp(&b.cloud_cover_percentage)
        });
        self
    }
}

impl<'a> IntoIterator for &'a TileTable {
    type Item = &'a TileRecord;
    type IntoIter = std::slice::Iter<'a, TileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Merged raster for one band
#[derive(Debug, Clone)]
pub struct MosaicRaster {
    pub band: Band,
    pub data: Array2<f32>,          // (rows, cols)
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
}

impl MosaicRaster {
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }
}

/// Red and near-infrared mosaics over the same extent
#[derive(Debug, Clone)]
pub struct BandMosaics {
    pub red: MosaicRaster,
    pub nir: MosaicRaster,
}

/// Catalog account
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Error types for the NDVI pipeline
#[derive(Debug, thiserror::Error)]
pub enum NdviError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {url} returned {status}")]
    Transport { url: String, status: u16 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Expected exactly one {band} raster under {}, found {matches}", root.display())]
    BandLookup {
        root: PathBuf,
        band: Band,
        matches: usize,
    },

    #[error("Out of order: {0}")]
    Sequencing(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for pipeline operations
pub type NdviResult<T> = Result<T, NdviError>;
