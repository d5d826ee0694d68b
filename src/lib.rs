//! verdant: Sentinel-2 NDVI from catalog search to a clipped raster
//!
//! Searches the Copernicus catalog for Level-1C tiles over an area of
//! interest, downloads and unpacks them, mosaics the red and near-infrared
//! bands, computes the vegetation index and clips it to the area.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AreaOfInterest, Band, BandMosaics, BoundingBox, Credentials, DateRange, GeoTransform,
    MosaicRaster, NdviError, NdviResult, TileRecord, TileTable, CATALOG_CRS,
};

pub use io::{ArchiveExtractor, CatalogClient, CatalogConfig, SearchOutcome, TileDownloader};
pub use crate::core::{
    AoiClipper, BandMosaicker, IndexComputer, NdviPipeline, PipelineConfig, PipelineState,
};
