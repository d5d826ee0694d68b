//! Stage-by-stage NDVI pipeline with explicit state
//!
//! Every stage takes the current [`PipelineState`] and hands back the next
//! one, so the working CRS and the band mosaics travel with the caller
//! instead of living in a shared session.

use crate::core::clip::AoiClipper;
use crate::core::crs::select_working_crs;
use crate::core::mosaic::BandMosaicker;
use crate::core::ndvi::IndexComputer;
use crate::io::archive::ArchiveExtractor;
use crate::io::catalog::{CatalogClient, CatalogConfig, SearchOutcome};
use crate::io::download::{DownloadConfig, TileDownloader};
use crate::types::{
    AreaOfInterest, BandMosaics, Credentials, DateRange, NdviError, NdviResult, TileTable,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub store_dir: PathBuf,          // archives and extracted products
    pub output_dir: PathBuf,         // index and clipped rasters
    pub catalog: CatalogConfig,
    pub download: DownloadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./data_store"),
            output_dir: PathBuf::from("./data_store"),
            catalog: CatalogConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

/// Working CRS and the area of interest expressed in it
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingFrame {
    pub crs: String,
    pub aoi: AreaOfInterest,
}

/// What the pipeline knows between stages
#[derive(Debug, Clone)]
pub struct PipelineState {
    aoi: AreaOfInterest,
    working: Option<WorkingFrame>,
    mosaics: Option<BandMosaics>,
}

impl PipelineState {
    pub fn new(aoi: AreaOfInterest) -> Self {
        Self {
            aoi,
            working: None,
            mosaics: None,
        }
    }

    /// Area of interest as supplied by the caller
    pub fn aoi(&self) -> &AreaOfInterest {
        &self.aoi
    }

    pub fn working(&self) -> Option<&WorkingFrame> {
        self.working.as_ref()
    }

    pub fn working_crs(&self) -> Option<&str> {
        self.working.as_ref().map(|w| w.crs.as_str())
    }

    pub fn mosaics(&self) -> Option<&BandMosaics> {
        self.mosaics.as_ref()
    }

    /// Choose the working CRS from `table` and reproject the area of interest
    /// into it
    pub fn with_working_crs(self, table: &TileTable) -> NdviResult<Self> {
        let crs = select_working_crs(table)?;
        let aoi = self.aoi.reproject(&crs)?;
        Ok(Self {
            working: Some(WorkingFrame { crs, aoi }),
            ..self
        })
    }

    pub fn with_mosaics(self, mosaics: BandMosaics) -> Self {
        Self {
            mosaics: Some(mosaics),
            ..self
        }
    }

    fn require_working(&self, stage: &str) -> NdviResult<&WorkingFrame> {
        self.working.as_ref().ok_or_else(|| {
            log::error!("{} requested before a working CRS was chosen", stage);
            NdviError::Sequencing(format!("{} needs a working CRS, run download first", stage))
        })
    }

    /// Write the index raster. The mosaics are released once used.
    pub fn compute_index(
        self,
        indexer: &IndexComputer,
        output_dir: &Path,
    ) -> NdviResult<(Self, PathBuf)> {
        let Some(mosaics) = self.mosaics.as_ref() else {
            log::error!("Index requested before mosaicking");
            return Err(NdviError::Sequencing("run mosaic first".to_string()));
        };
        let working = self.require_working("index computation")?;

        let path = indexer.compute_index(mosaics, &working.crs, output_dir)?;
        Ok((
            Self {
                mosaics: None,
                ..self
            },
            path,
        ))
    }

    /// Clip a raster in the working CRS to the reprojected area of interest
    pub fn clip(&self, clipper: &AoiClipper, raster_path: &Path) -> NdviResult<PathBuf> {
        let working = self.require_working("clipping")?;
        clipper.clip(raster_path, &working.aoi)
    }
}

/// Products of a full run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutputs {
    pub index: PathBuf,
    pub clipped: PathBuf,
}

/// Catalog search through clipped NDVI, one stage per call
pub struct NdviPipeline {
    config: PipelineConfig,
    catalog: CatalogClient,
    downloader: TileDownloader,
    extractor: ArchiveExtractor,
    mosaicker: BandMosaicker,
    indexer: IndexComputer,
    clipper: AoiClipper,
}

impl NdviPipeline {
    pub fn new(credentials: Credentials, config: PipelineConfig) -> NdviResult<Self> {
        let catalog = CatalogClient::new(credentials.clone(), config.catalog.clone())?;
        let downloader = TileDownloader::new(credentials, config.download.clone())?;

        log::debug!(
            "Pipeline store {}, output {}",
            config.store_dir.display(),
            config.output_dir.display()
        );

        Ok(Self {
            config,
            catalog,
            downloader,
            extractor: ArchiveExtractor::new(),
            mosaicker: BandMosaicker::new(),
            indexer: IndexComputer::new(),
            clipper: AoiClipper::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn search(
        &self,
        state: &PipelineState,
        dates: &DateRange,
        max_rows: usize,
    ) -> NdviResult<SearchOutcome> {
        self.catalog.search(state.aoi(), dates, max_rows)
    }

    /// Fix the working CRS from `table`, then fetch its archives into the store
    pub fn download(
        &self,
        state: PipelineState,
        table: &TileTable,
    ) -> NdviResult<(PipelineState, Vec<PathBuf>)> {
        if table.is_empty() {
            return Err(NdviError::InvalidInput("no tiles selected for download".to_string()));
        }
        let state = state.with_working_crs(table)?;
        let archives = self.downloader.download(table, &self.config.store_dir)?;
        Ok((state, archives))
    }

    pub fn extract(&self, archives: &[PathBuf]) -> Vec<PathBuf> {
        self.extractor.extract(archives, &self.config.store_dir)
    }

    pub fn mosaic(&self, state: PipelineState, roots: &[PathBuf]) -> NdviResult<PipelineState> {
        let working_crs = state.require_working("mosaicking")?.crs.clone();
        let mosaics = self.mosaicker.mosaic(roots, &working_crs)?;
        Ok(state.with_mosaics(mosaics))
    }

    pub fn compute_index(&self, state: PipelineState) -> NdviResult<(PipelineState, PathBuf)> {
        state.compute_index(&self.indexer, &self.config.output_dir)
    }

    pub fn clip(&self, state: &PipelineState, raster_path: &Path) -> NdviResult<PathBuf> {
        state.clip(&self.clipper, raster_path)
    }

    /// Run every stage for one area and date window.
    ///
    /// `select` picks the rows to download from the search result; return the
    /// table unchanged to take everything. `Ok(None)` when nothing was found.
    pub fn run<F>(
        &self,
        aoi: AreaOfInterest,
        dates: &DateRange,
        max_rows: usize,
        select: F,
    ) -> NdviResult<Option<PipelineOutputs>>
    where
        F: FnOnce(&TileTable) -> TileTable,
    {
        let state = PipelineState::new(aoi);

        let table = match self.search(&state, dates, max_rows)? {
            SearchOutcome::Matched(table) => table,
            SearchOutcome::QueryFailed { status, reason } => {
                log::warn!("Catalog search failed ({:?}): {}", status, reason);
                return Ok(None);
            }
        };

        let selected = select(&table);
        if selected.is_empty() {
            log::info!("No tiles to process");
            return Ok(None);
        }
        log::info!("Processing {} of {} tiles", selected.len(), table.len());

        let (state, archives) = self.download(state, &selected)?;
        let roots = self.extract(&archives);
        let state = self.mosaic(state, &roots)?;
        let (state, index) = self.compute_index(state)?;
        let clipped = self.clip(&state, &index)?;

        Ok(Some(PipelineOutputs { index, clipped }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, MosaicRaster, TileRecord, Band};
    use chrono::{TimeZone, Utc};
    use geo::MultiPolygon;
    use ndarray::Array2;

    fn local_aoi() -> AreaOfInterest {
        AreaOfInterest::new(
            BoundingBox { min_x: 0.0, min_y: 0.0, max_x: 10.0, max_y: 10.0 }.to_polygon(),
            "+proj=utm +zone=32 +datum=WGS84 +units=m +no_defs +type=crs",
        )
        .unwrap()
    }

    fn record(crs: &str) -> TileRecord {
        TileRecord {
            tile_id: "S2A_MSIL1C_20230105T101319_N0509_R022_T32TQM_20230105T105811".to_string(),
            acquisition_date: Utc.with_ymd_and_hms(2023, 1, 5, 10, 13, 19).unwrap(),
            tile_number: "N0509_R022_T32TQM".to_string(),
            link: "https://example.org/odata/v1/Products('x')/".to_string(),
            footprint: MultiPolygon(vec![]),
            area: 1.0,
            cloud_cover_percentage: 3.0,
            crs: crs.to_string(),
        }
    }

    fn mosaics() -> BandMosaics {
        let band = |band, value| MosaicRaster {
            band,
            data: Array2::from_elem((2, 2), value),
            transform: GeoTransform::north_up(0.0, 20.0, 10.0, -10.0),
            nodata: None,
        };
        BandMosaics {
            red: band(Band::Red, 100.0),
            nir: band(Band::NearInfrared, 300.0),
        }
    }

    #[test]
    fn test_default_config_uses_data_store() {
        let config = PipelineConfig::default();
        assert_eq!(config.store_dir, PathBuf::from("./data_store"));
        assert_eq!(config.download.chunk_size, 8192);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "store_dir": "/tmp/store",
            "output_dir": "/tmp/out",
            "catalog": {
                "endpoint": "http://localhost:8080/search",
                "platform": "Sentinel-2",
                "product_type": "S2MSI1C",
                "timeout_secs": 5,
                "footprint_report": null
            },
            "download": {
                "chunk_size": 1024,
                "connect_timeout_secs": 1,
                "timeout_secs": 10,
                "show_progress": false,
                "value_suffix": "$value"
            }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.download.chunk_size, 1024);
        assert!(!config.download.show_progress);
    }

    #[test]
    fn test_index_before_mosaic_is_a_sequencing_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = PipelineState::new(local_aoi());
        match state.compute_index(&IndexComputer::new(), dir.path()) {
            Err(NdviError::Sequencing(msg)) => assert_eq!(msg, "run mosaic first"),
            other => panic!("expected sequencing error, got {:?}", other.map(|(_, p)| p)),
        }
    }

    #[test]
    fn test_clip_without_working_crs_is_a_sequencing_error() {
        let state = PipelineState::new(local_aoi());
        let result = state.clip(&AoiClipper::new(), Path::new("1700000000_ndvi.tif"));
        assert!(matches!(result, Err(NdviError::Sequencing(_))));
    }

    #[test]
    fn test_working_crs_keeps_caller_aoi() {
        let crs = local_aoi().crs().to_string();
        let table = TileTable::new(vec![record(&crs)]);

        let state = PipelineState::new(local_aoi()).with_working_crs(&table).unwrap();
        assert_eq!(state.working_crs(), Some(crs.as_str()));
        assert_eq!(state.aoi(), &local_aoi());
        assert_eq!(state.working().unwrap().aoi, local_aoi());
    }

    #[test]
    fn test_working_crs_needs_tiles() {
        let state = PipelineState::new(local_aoi());
        assert!(state.with_working_crs(&TileTable::default()).is_err());
    }

    #[test]
    fn test_compute_index_releases_mosaics() {
        let dir = tempfile::TempDir::new().unwrap();
        let crs = local_aoi().crs().to_string();
        let table = TileTable::new(vec![record(&crs)]);

        let state = PipelineState::new(local_aoi())
            .with_working_crs(&table)
            .unwrap()
            .with_mosaics(mosaics());
        assert!(state.mosaics().is_some());

        let (state, path) = state.compute_index(&IndexComputer::new(), dir.path()).unwrap();
        assert!(path.exists());
        assert!(state.mosaics().is_none());
        assert!(state.working().is_some());

        let again = state.compute_index(&IndexComputer::new(), dir.path());
        assert!(matches!(again, Err(NdviError::Sequencing(_))));
    }
}
