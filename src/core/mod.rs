//! Processing stages: working CRS, mosaics, vegetation index, clipping

pub mod crs;
pub mod mosaic;
pub mod ndvi;
pub mod clip;
pub mod pipeline;

pub use crs::{select_working_crs, utm_crs};
pub use mosaic::{find_band_file, merge_rasters, BandMosaicker};
pub use ndvi::{ndvi, normalized_difference, IndexComputer, OutputName, Stage};
pub use clip::{aoi_window, clipped_path, mask_to_aoi, AoiClipper, PixelWindow};
pub use pipeline::{NdviPipeline, PipelineConfig, PipelineOutputs, PipelineState, WorkingFrame};
