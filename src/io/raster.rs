use crate::types::{GeoTransform, NdviError, NdviResult};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// First band of a georeferenced raster, read into memory
#[derive(Debug, Clone)]
pub struct BandRaster {
    pub data: Array2<f32>,        // (rows, cols)
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub crs_wkt: Option<String>,
}

/// Read band 1 of a raster as f32
pub fn read_band<P: AsRef<Path>>(path: P) -> NdviResult<BandRaster> {
    log::debug!("Opening raster: {}", path.as_ref().display());

    let dataset = Dataset::open(path.as_ref())?;
    let (width, height) = dataset.raster_size();
    let transform = GeoTransform::from_gdal(dataset.geo_transform()?);

    let rasterband = dataset.rasterband(1)?;
    let nodata = rasterband.no_data_value();
    let buffer = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let data = Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| NdviError::Processing(format!("Failed to reshape raster data: {}", e)))?;

    let crs_wkt = dataset.spatial_ref().ok().and_then(|srs| srs.to_wkt().ok());

    log::debug!("Raster {}x{}, transform {:?}, nodata {:?}", width, height, transform, nodata);

    Ok(BandRaster {
        data,
        transform,
        nodata,
        crs_wkt,
    })
}

/// Where the spatial reference of a new raster comes from
#[derive(Debug, Clone, Copy)]
pub enum CrsSource<'a> {
    /// Any definition GDAL accepts (EPSG code, proj string, WKT)
    Definition(&'a str),
    Wkt(&'a str),
}

impl CrsSource<'_> {
    fn spatial_ref(&self) -> NdviResult<SpatialRef> {
        let srs = match self {
            CrsSource::Definition(definition) => SpatialRef::from_definition(definition)?,
            CrsSource::Wkt(wkt) => SpatialRef::from_wkt(wkt)?,
        };
        Ok(srs)
    }
}

/// Write a single-band float32 GeoTIFF
pub fn write_float_raster<P: AsRef<Path>>(
    path: P,
    data: &Array2<f32>,
    transform: &GeoTransform,
    crs: Option<CrsSource<'_>>,
    nodata: Option<f64>,
) -> NdviResult<()> {
    let (height, width) = data.dim();
    if width == 0 || height == 0 {
        return Err(NdviError::Processing(format!(
            "Refusing to write empty {}x{} raster to {}",
            width,
            height,
            path.as_ref().display()
        )));
    }

    log::debug!("Writing {}x{} float32 raster: {}", width, height, path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<f32, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;

    dataset.set_geo_transform(&transform.to_gdal())?;

    if let Some(crs) = crs {
        dataset.set_spatial_ref(&crs.spatial_ref()?)?;
    }

    let mut band = dataset.rasterband(1)?;
    if nodata.is_some() {
        band.set_no_data_value(nodata)?;
    }

    let values: Vec<f32> = data.iter().copied().collect();
    let buffer = Buffer::new((width, height), values);
    band.write((0, 0), (width, height), &buffer)?;

    Ok(())
}
