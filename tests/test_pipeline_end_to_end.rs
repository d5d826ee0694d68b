//! Offline run of every stage after the catalog search, on synthetic products
//! whose band files are small GeoTIFFs under Sentinel-2 names.

use approx::assert_relative_eq;
use chrono::{TimeZone, Utc};
use geo::{MultiPolygon, Polygon};
use ndarray::Array2;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use verdant::core::crs::utm_crs;
use verdant::core::ndvi::{OutputName, Stage};
use verdant::io::raster::{read_band, write_float_raster, CrsSource};
use verdant::types::{
    AreaOfInterest, Credentials, GeoTransform, NdviError, TileRecord, TileTable,
};
use verdant::{NdviPipeline, PipelineConfig, PipelineState};
use zip::write::FileOptions;
use zip::ZipWriter;

const WEST: &str = "S2A_MSIL1C_20230105T101319_N0509_R022_T32TNR_20230105T105811";
const EAST: &str = "S2A_MSIL1C_20230105T101319_N0509_R022_T32TPR_20230105T105811";
const OTHER_ZONE: &str = "S2A_MSIL1C_20230105T101319_N0509_R022_T33TUL_20230105T105811";

const ORIGIN_X: f64 = 500_000.0;
const ORIGIN_Y: f64 = 5_000_100.0;
const PIXEL: f64 = 10.0;
const SIZE: usize = 10;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn record(product: &str, zone: u8) -> TileRecord {
    TileRecord {
        tile_id: product.to_string(),
        acquisition_date: Utc.with_ymd_and_hms(2023, 1, 5, 10, 13, 19).unwrap(),
        tile_number: "N0509_R022_T32TNR".to_string(),
        link: format!("https://catalog.test/odata/v1/Products('{}')/", product),
        footprint: MultiPolygon::new(vec![]),
        area: 1.0,
        cloud_cover_percentage: 5.0,
        crs: utm_crs(zone),
    }
}

/// Zip a `<product>.SAFE` folder with constant red and near-infrared bands
fn write_product_zip(
    store: &Path,
    product: &str,
    zone: u8,
    origin_x: f64,
    red: f32,
    nir: f32,
) -> PathBuf {
    let staging = tempfile::TempDir::new().unwrap();
    let transform = GeoTransform::north_up(origin_x, ORIGIN_Y, PIXEL, -PIXEL);
    let crs = utm_crs(zone);

    let mut bands = Vec::new();
    for (code, value) in [("B04", red), ("B08", nir)] {
        let path = staging.path().join(format!("{}.tif", code));
        write_float_raster(
            &path,
            &Array2::from_elem((SIZE, SIZE), value),
            &transform,
            Some(CrsSource::Definition(&crs)),
            Some(0.0),
        )
        .expect("Failed to write band raster");
        bands.push((code, fs::read(&path).unwrap()));
    }

    let archive = store.join(format!("{}.zip", product));
    let mut zip = ZipWriter::new(File::create(&archive).unwrap());
    let options = FileOptions::default();
    let img_data = format!("{}.SAFE/GRANULE/L1C_T32TNR_A039360_20230105T101317/IMG_DATA", product);
    for (code, bytes) in bands {
        zip.start_file(format!("{}/T32TNR_20230105T101319_{}.jp2", img_data, code), options)
            .unwrap();
        zip.write_all(&bytes).unwrap();
    }
    zip.finish().unwrap();
    archive
}

fn pipeline(store: &Path, output: &Path) -> NdviPipeline {
    let mut config = PipelineConfig::default();
    config.store_dir = store.to_path_buf();
    config.output_dir = output.to_path_buf();
    config.download.show_progress = false;
    NdviPipeline::new(Credentials::new("user", "secret"), config).expect("Failed to create pipeline")
}

/// Triangle over the west tile: right angle at the south-west corner
fn triangle_aoi(zone: u8) -> AreaOfInterest {
    let polygon = Polygon::new(
        vec![
            (ORIGIN_X + 20.0, ORIGIN_Y - 70.0),
            (ORIGIN_X + 70.0, ORIGIN_Y - 70.0),
            (ORIGIN_X + 20.0, ORIGIN_Y - 20.0),
            (ORIGIN_X + 20.0, ORIGIN_Y - 70.0),
        ]
        .into(),
        vec![],
    );
    AreaOfInterest::new(polygon, utm_crs(zone)).expect("valid area of interest")
}

#[test]
fn test_single_tile_through_clip() {
    init_logging();
    let store = tempfile::TempDir::new().unwrap();
    let output = store.path().join("out");
    let pipeline = pipeline(store.path(), &output);

    let archive = write_product_zip(store.path(), WEST, 32, ORIGIN_X, 100.0, 300.0);
    let table = TileTable::new(vec![record(WEST, 32)]);

    let state = PipelineState::new(triangle_aoi(32))
        .with_working_crs(&table)
        .expect("Failed to choose working CRS");
    assert_eq!(state.working_crs(), Some(utm_crs(32).as_str()));

    let roots = pipeline.extract(&[archive.clone()]);
    assert_eq!(roots, vec![store.path().join(format!("{}.SAFE", WEST))]);
    assert!(!archive.exists());

    let state = pipeline.mosaic(state, &roots).expect("Failed to mosaic");
    let mosaics = state.mosaics().expect("mosaics stored in state");
    assert_eq!(mosaics.red.data.dim(), (SIZE, SIZE));
    assert_eq!(
        mosaics.red.transform,
        GeoTransform::north_up(ORIGIN_X, ORIGIN_Y, PIXEL, -PIXEL)
    );

    let (state, index_path) = pipeline.compute_index(state).expect("Failed to compute NDVI");
    assert!(state.mosaics().is_none());
    assert_eq!(index_path.parent(), Some(output.as_path()));
    assert_eq!(OutputName::parse(&index_path).map(|n| n.stage), Some(Stage::Ndvi));

    let index = read_band(&index_path).expect("Failed to read NDVI");
    assert_eq!(index.data.dim(), (SIZE, SIZE));
    assert_eq!(index.transform, GeoTransform::north_up(ORIGIN_X, ORIGIN_Y, PIXEL, -PIXEL));
    assert!(index.crs_wkt.is_some());
    for value in index.data.iter() {
        assert_relative_eq!(*value, 0.5);
    }

    let clipped_path = pipeline.clip(&state, &index_path).expect("Failed to clip");
    assert_eq!(
        OutputName::parse(&clipped_path).map(|n| n.stage),
        Some(Stage::ClippedNdvi)
    );

    let clipped = read_band(&clipped_path).expect("Failed to read clipped NDVI");
    let (rows, cols) = clipped.data.dim();
    println!("Clipped raster: {}x{}", cols, rows);
    assert_eq!((rows, cols), (5, 5));
    assert!(rows <= SIZE && cols <= SIZE);
    assert!(clipped.nodata.map_or(false, f64::is_nan));
    assert_eq!(
        clipped.transform,
        GeoTransform::north_up(ORIGIN_X + 20.0, ORIGIN_Y - 20.0, PIXEL, -PIXEL)
    );

    let mut inside = 0;
    for ((row, col), value) in clipped.data.indexed_iter() {
        let (x, y) = clipped.transform.pixel_center(row, col);
        let expected_inside = (x - (ORIGIN_X + 20.0)) + (y - (ORIGIN_Y - 70.0)) < 50.0;
        if expected_inside {
            inside += 1;
            assert_relative_eq!(*value, 0.5);
        } else {
            assert!(value.is_nan(), "pixel ({}, {}) should be masked", row, col);
        }
    }
    assert!(inside > 0);
}

#[test]
fn test_adjacent_tiles_are_mosaicked() {
    init_logging();
    let store = tempfile::TempDir::new().unwrap();
    let output = store.path().join("out");
    let pipeline = pipeline(store.path(), &output);

    let west = write_product_zip(store.path(), WEST, 32, ORIGIN_X, 100.0, 300.0);
    let east = write_product_zip(
        store.path(),
        EAST,
        32,
        ORIGIN_X + SIZE as f64 * PIXEL,
        200.0,
        200.0,
    );
    let table = TileTable::new(vec![record(WEST, 32), record(EAST, 32)]);

    let state = PipelineState::new(triangle_aoi(32)).with_working_crs(&table).unwrap();
    let roots = pipeline.extract(&[west, east]);
    assert_eq!(roots.len(), 2);

    let state = pipeline.mosaic(state, &roots).expect("Failed to mosaic");
    let (_, index_path) = pipeline.compute_index(state).expect("Failed to compute NDVI");

    let index = read_band(&index_path).unwrap();
    assert_eq!(index.data.dim(), (SIZE, 2 * SIZE));
    assert_relative_eq!(index.data[[0, 0]], 0.5);
    assert_relative_eq!(index.data[[SIZE - 1, SIZE - 1]], 0.5);
    assert_eq!(index.data[[0, SIZE]], 0.0);
    assert_eq!(index.data[[SIZE - 1, 2 * SIZE - 1]], 0.0);
}

#[test]
fn test_tiles_outside_working_zone_fail_mosaic() {
    init_logging();
    let store = tempfile::TempDir::new().unwrap();
    let output = store.path().join("out");
    let pipeline = pipeline(store.path(), &output);

    let west = write_product_zip(store.path(), WEST, 32, ORIGIN_X, 100.0, 300.0);
    let other = write_product_zip(store.path(), OTHER_ZONE, 33, ORIGIN_X, 100.0, 100.0);

    let mut minor = record(OTHER_ZONE, 33);
    minor.area = 0.25;
    let table = TileTable::new(vec![minor, record(WEST, 32)]);

    let state = PipelineState::new(triangle_aoi(32)).with_working_crs(&table).unwrap();
    assert_eq!(state.working_crs(), Some(utm_crs(32).as_str()));

    let roots = pipeline.extract(&[west, other]);
    assert_eq!(roots.len(), 2);

    match pipeline.mosaic(state, &roots) {
        Err(NdviError::InvalidInput(msg)) => {
            println!("Mosaic refused: {}", msg);
            assert!(msg.contains(OTHER_ZONE));
            assert!(!msg.contains(WEST));
        }
        other => panic!("expected zone mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_clipping_twice_keeps_first_clip() {
    init_logging();
    let store = tempfile::TempDir::new().unwrap();
    let output = store.path().join("out");
    let pipeline = pipeline(store.path(), &output);

    let archive = write_product_zip(store.path(), WEST, 32, ORIGIN_X, 100.0, 300.0);
    let table = TileTable::new(vec![record(WEST, 32)]);
    let state = PipelineState::new(triangle_aoi(32)).with_working_crs(&table).unwrap();

    let roots = pipeline.extract(&[archive]);
    let state = pipeline.mosaic(state, &roots).unwrap();
    let (state, index_path) = pipeline.compute_index(state).unwrap();
    let clipped_path = pipeline.clip(&state, &index_path).unwrap();
    let before = fs::read(&clipped_path).unwrap();

    let again = pipeline.clip(&state, &clipped_path);
    assert!(matches!(again, Err(NdviError::InvalidInput(_))));
    assert_eq!(fs::read(&clipped_path).unwrap(), before);
}

#[test]
fn test_product_missing_a_band_fails_mosaic() {
    let store = tempfile::TempDir::new().unwrap();
    let pipeline = pipeline(store.path(), store.path());

    let root = store.path().join(format!("{}.SAFE", WEST));
    let img_data = root.join("GRANULE").join("L1C_T32TNR").join("IMG_DATA");
    fs::create_dir_all(&img_data).unwrap();
    write_float_raster(
        img_data.join("T32TNR_20230105T101319_B04.jp2"),
        &Array2::from_elem((2, 2), 1.0),
        &GeoTransform::north_up(ORIGIN_X, ORIGIN_Y, PIXEL, -PIXEL),
        None,
        None,
    )
    .unwrap();

    let table = TileTable::new(vec![record(WEST, 32)]);
    let state = PipelineState::new(triangle_aoi(32)).with_working_crs(&table).unwrap();

    match pipeline.mosaic(state, &[root]) {
        Err(NdviError::BandLookup { matches, .. }) => assert_eq!(matches, 0),
        other => panic!("expected band lookup failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_stages_out_of_order() {
    let store = tempfile::TempDir::new().unwrap();
    let pipeline = pipeline(store.path(), store.path());

    let state = PipelineState::new(triangle_aoi(32));
    assert!(matches!(
        pipeline.mosaic(state.clone(), &[]),
        Err(NdviError::Sequencing(_))
    ));
    assert!(matches!(
        pipeline.compute_index(state),
        Err(NdviError::Sequencing(_))
    ));
}

#[test]
fn test_download_of_empty_selection_is_rejected() {
    let store = tempfile::TempDir::new().unwrap();
    let pipeline = pipeline(store.path(), store.path());

    let result = pipeline.download(PipelineState::new(triangle_aoi(32)), &TileTable::default());
    assert!(matches!(result, Err(NdviError::InvalidInput(_))));
}
