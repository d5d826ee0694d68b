//! I/O modules: catalog queries, tile transfer, archives and raster files

pub mod catalog;
pub mod download;
pub mod archive;
pub mod raster;

pub use catalog::{CatalogClient, CatalogConfig, ProductIdentifier, SearchOutcome};
pub use download::{DownloadConfig, TileDownloader};
pub use archive::ArchiveExtractor;
pub use raster::{read_band, write_float_raster, BandRaster, CrsSource};
