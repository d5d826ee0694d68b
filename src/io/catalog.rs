use crate::core::crs::utm_crs;
use crate::types::{
    AreaOfInterest, Credentials, DateRange, NdviError, NdviResult, TileRecord, TileTable,
    CATALOG_CRS,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use geo::{Area, BoundingRect, Intersects, MultiPolygon, Polygon};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Catalog query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub platform: String,
    pub product_type: String,
    pub timeout_secs: u64,
    /// Write kept footprints as GeoJSON here after each search
    pub footprint_report: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://scihub.copernicus.eu/dhus/search".to_string(),
            platform: "Sentinel-2".to_string(),
            product_type: "S2MSI1C".to_string(),   // Level-1C top-of-atmosphere
            timeout_secs: 60,
            footprint_report: None,
        }
    }
}

/// Parsed Sentinel-2 product name, e.g.
/// `S2B_MSIL1C_20230105T101319_N0509_R022_T32TQM_20230105T105811`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductIdentifier {
    pub mission: String,                 // S2A, S2B, ...
    pub product_level: String,           // L1C, L2A
    pub sensing_time: DateTime<Utc>,
    pub baseline: String,                // N0509
    pub relative_orbit: String,          // R022
    pub tile: String,                    // T32TQM
    pub utm_zone: u8,
    pub generation_time: DateTime<Utc>,
}

fn identifier_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(S2[A-D])_MSI(L1C|L2A)_(\d{8}T\d{6})_(N\d{4})_(R\d{3})_(T(\d{2})[A-Z]{3})_(\d{8}T\d{6})$",
        )
        .expect("static product identifier pattern")
    })
}

fn parse_compact_time(value: &str) -> NdviResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .map_err(|e| NdviError::InvalidFormat(format!("Bad timestamp '{}': {}", value, e)))
}

impl ProductIdentifier {
    pub fn parse(title: &str) -> NdviResult<Self> {
        let caps = identifier_regex().captures(title).ok_or_else(|| {
            NdviError::InvalidFormat(format!("Not a Sentinel-2 product identifier: {}", title))
        })?;

        let utm_zone: u8 = caps[7]
            .parse()
            .map_err(|e| NdviError::InvalidFormat(format!("Bad UTM zone in {}: {}", title, e)))?;
        if !(1..=60).contains(&utm_zone) {
            return Err(NdviError::InvalidFormat(format!(
                "UTM zone {} out of range in {}",
                utm_zone, title
            )));
        }

        Ok(Self {
            mission: caps[1].to_string(),
            product_level: caps[2].to_string(),
            sensing_time: parse_compact_time(&caps[3])?,
            baseline: caps[4].to_string(),
            relative_orbit: caps[5].to_string(),
            tile: caps[6].to_string(),
            utm_zone,
            generation_time: parse_compact_time(&caps[8])?,
        })
    }

    /// Parse from an extracted root or archive path (`<id>.SAFE`, `<id>.zip`)
    pub fn from_path(path: &Path) -> NdviResult<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| NdviError::InvalidFormat(format!("No product name in {}", path.display())))?;
        Self::parse(stem)
    }

    /// Grid designator as used in the tile table: `N0509_R022_T32TQM`
    pub fn tile_number(&self) -> String {
        format!("{}_{}_{}", self.baseline, self.relative_orbit, self.tile)
    }

    pub fn crs(&self) -> String {
        utm_crs(self.utm_zone)
    }
}

/// Result of a catalog query; a failed query is distinct from zero matches
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Matched(TileTable),
    QueryFailed {
        status: Option<u16>,
        reason: String,
    },
}

impl SearchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SearchOutcome::QueryFailed { .. })
    }

    /// Collapse to a table, a failed query giving an empty one
    pub fn into_table(self) -> TileTable {
        match self {
            SearchOutcome::Matched(table) => table,
            SearchOutcome::QueryFailed { .. } => TileTable::default(),
        }
    }
}

// The catalog's JSON flattens single-element arrays into objects
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

fn flatten<T>(value: Option<OneOrMany<T>>) -> Vec<T> {
    value.map(OneOrMany::into_vec).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    feed: Feed,
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "opensearch:totalResults", default)]
    total_results: Option<serde_json::Value>,
    #[serde(default)]
    entry: Option<OneOrMany<Entry>>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    title: String,
    #[serde(default)]
    link: Option<OneOrMany<Link>>,
    #[serde(rename = "str", default)]
    strings: Option<OneOrMany<NamedValue>>,
    #[serde(default)]
    double: Option<OneOrMany<NamedValue>>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    href: String,
    #[serde(default)]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedValue {
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: serde_json::Value,
}

impl NamedValue {
    fn as_f64(&self) -> Option<f64> {
        match &self.content {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Parse a WKT footprint (POLYGON or MULTIPOLYGON)
pub fn parse_footprint(wkt: &str) -> NdviResult<MultiPolygon<f64>> {
    let geometry = gdal::vector::Geometry::from_wkt(wkt)?.to_geo()?;
    match geometry {
        geo::Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon])),
        geo::Geometry::MultiPolygon(multi) => Ok(multi),
        other => Err(NdviError::InvalidFormat(format!(
            "Footprint is not polygonal: {:?}",
            other
        ))),
    }
}

/// WKT for a single-ring polygon
pub fn polygon_wkt(polygon: &Polygon<f64>) -> String {
    let coords: Vec<String> = polygon
        .exterior()
        .coords()
        .map(|c| format!("{} {}", c.x, c.y))
        .collect();
    format!("POLYGON (({}))", coords.join(", "))
}

/// Search client for the imagery catalog
pub struct CatalogClient {
    config: CatalogConfig,
    credentials: Credentials,
    client: reqwest::blocking::Client,
}

impl CatalogClient {
    pub fn new(credentials: Credentials, config: CatalogConfig) -> NdviResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            config,
            credentials,
            client,
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Query text combining product type, bbox footprint and date predicates
    pub fn build_query(&self, aoi: &AreaOfInterest, dates: &DateRange) -> String {
        let boundary = aoi.bounds().to_polygon();
        let range = dates.to_query_range();
        format!(
            "platformname:{} AND producttype:{} AND footprint:\"Intersects({})\" AND beginPosition:{} AND endPosition:{}",
            self.config.platform,
            self.config.product_type,
            polygon_wkt(&boundary),
            range,
            range
        )
    }

    /// Search the catalog for tiles over `aoi` acquired within `dates`.
    ///
    /// Transport and response failures come back as
    /// [`SearchOutcome::QueryFailed`]; only invalid arguments are errors.
    pub fn search(
        &self,
        aoi: &AreaOfInterest,
        dates: &DateRange,
        max_rows: usize,
    ) -> NdviResult<SearchOutcome> {
        if max_rows == 0 {
            return Err(NdviError::InvalidInput("max_rows must be at least 1".to_string()));
        }

        let aoi = aoi.reproject(CATALOG_CRS)?;
        let bounds = aoi.bounds();
        let query = self.build_query(&aoi, dates);

        log::info!(
            "Catalog search: bbox [{}, {}, {}, {}], dates {}, up to {} results",
            bounds.min_x,
            bounds.min_y,
            bounds.max_x,
            bounds.max_y,
            dates.to_query_range(),
            max_rows
        );
        log::debug!("Catalog query: {}", query);

        let rows = max_rows.to_string();
        let response = self
            .client
            .get(&self.config.endpoint)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .query(&[
                ("q", query.as_str()),
                ("start", "0"),
                ("rows", rows.as_str()),
                ("format", "json"),
            ])
            .send();

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                log::error!("Catalog request failed: {}", e);
                return Ok(SearchOutcome::QueryFailed {
                    status: None,
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status();
        log::info!("Catalog responded with {}", status);
        if !status.is_success() {
            return Ok(SearchOutcome::QueryFailed {
                status: Some(status.as_u16()),
                reason: format!("catalog returned {}", status),
            });
        }

        let body = match response.text() {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to read catalog response: {}", e);
                return Ok(SearchOutcome::QueryFailed {
                    status: Some(status.as_u16()),
                    reason: e.to_string(),
                });
            }
        };

        let table = match Self::parse_response(&body, &aoi) {
            Ok(table) => table,
            Err(e) => {
                log::error!("Failed to parse catalog response: {}", e);
                return Ok(SearchOutcome::QueryFailed {
                    status: Some(status.as_u16()),
                    reason: e.to_string(),
                });
            }
        };

        if table.is_empty() {
            log::info!("No tiles found");
        }

        if let Some(report) = &self.config.footprint_report {
            if let Err(e) = write_footprint_report(&table, report) {
                log::warn!("Could not write footprint report {}: {}", report.display(), e);
            }
        }

        Ok(SearchOutcome::Matched(table))
    }

    /// Turn a catalog JSON body into the table of tiles intersecting `aoi`.
    ///
    /// `aoi` must be in catalog coordinates.
    pub fn parse_response(body: &str, aoi: &AreaOfInterest) -> NdviResult<TileTable> {
        let response: SearchResponse = serde_json::from_str(body)?;

        if let Some(total) = &response.feed.total_results {
            log::info!("Catalog reports {} total results", total);
        }

        let mut records = Vec::new();
        for entry in flatten(response.feed.entry) {
            match Self::record_from_entry(entry, aoi) {
                Ok(Some(record)) => {
                    log::info!("{}", record.tile_id);
                    records.push(record);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Skipping catalog entry: {}", e),
            }
        }

        Ok(TileTable::new(records))
    }

    fn record_from_entry(entry: Entry, aoi: &AreaOfInterest) -> NdviResult<Option<TileRecord>> {
        let title = entry.title;

        let footprint_wkt = flatten(entry.strings)
            .into_iter()
            .find(|s| s.name == "footprint")
            .and_then(|s| s.as_str().map(str::to_string))
            .filter(|wkt| !wkt.trim().is_empty());
        let footprint_wkt = match footprint_wkt {
            Some(wkt) => wkt,
            None => {
                log::debug!("{} has no footprint, skipped", title);
                return Ok(None);
            }
        };

        let footprint = parse_footprint(&footprint_wkt)?;
        if !footprint.intersects(aoi.polygon()) {
            log::debug!("{} does not intersect the area of interest", title);
            return Ok(None);
        }

        let link = flatten(entry.link)
            .into_iter()
            .find(|l| l.rel.as_deref() == Some("alternative"))
            .map(|l| l.href)
            .ok_or_else(|| NdviError::InvalidFormat(format!("{} has no alternative link", title)))?;

        let doubles = flatten(entry.double);
        let cloud_cover = doubles
            .iter()
            .find(|d| d.name == "cloudcoverpercentage")
            .or_else(|| if doubles.len() == 1 { doubles.first() } else { None })
            .and_then(NamedValue::as_f64)
            .unwrap_or_else(|| {
                log::debug!("{} has no cloud cover value", title);
                f64::NAN
            });

        let identifier = ProductIdentifier::parse(&title)?;

        if let Some(rect) = footprint.bounding_rect() {
            log::debug!(
                "{} footprint bounds: [{}, {}, {}, {}]",
                title,
                rect.min().x,
                rect.min().y,
                rect.max().x,
                rect.max().y
            );
        }

        Ok(Some(TileRecord {
            acquisition_date: identifier.sensing_time,
            tile_number: identifier.tile_number(),
            area: footprint.unsigned_area(),
            crs: identifier.crs(),
            link,
            footprint,
            cloud_cover_percentage: cloud_cover,
            tile_id: title,
        }))
    }
}

/// GeoJSON FeatureCollection of the table's footprints
pub fn footprints_geojson(table: &TileTable) -> serde_json::Value {
    let features: Vec<serde_json::Value> = table
        .iter()
        .map(|record| {
            let polygons: Vec<Vec<Vec<[f64; 2]>>> = record
                .footprint
                .iter()
                .map(|polygon| {
                    std::iter::once(polygon.exterior())
                        .chain(polygon.interiors())
                        .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
                        .collect()
                })
                .collect();

            serde_json::json!({
                "type": "Feature",
                "geometry": { "type": "MultiPolygon", "coordinates": polygons },
                "properties": {
                    "tile_id": record.tile_id,
                    "tile_number": record.tile_number,
                    "acquisition_date": record.acquisition_date.to_rfc3339(),
                    "cloudcoverpercentage": record.cloud_cover_percentage,
                    "crs": record.crs,
                },
            })
        })
        .collect();

    serde_json::json!({ "type": "FeatureCollection", "features": features })
}

pub fn write_footprint_report(table: &TileTable, path: &Path) -> NdviResult<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), &footprints_geojson(table))?;
    log::info!("Footprints of {} tiles written to {}", table.len(), path.display());
    Ok(())
}
