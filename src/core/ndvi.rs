//! Normalized difference vegetation index

use crate::io::raster::{write_float_raster, CrsSource};
use crate::types::{BandMosaics, NdviError, NdviResult};
use ndarray::{Array2, Zip};
use num_traits::Float;
use std::path::{Path, PathBuf};

/// Output products written by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ndvi,
    ClippedNdvi,
}

impl Stage {
    pub fn tag(&self) -> &'static str {
        match self {
            Stage::Ndvi => "ndvi",
            Stage::ClippedNdvi => "clipped_ndvi",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ndvi" => Some(Stage::Ndvi),
            "clipped_ndvi" => Some(Stage::ClippedNdvi),
            _ => None,
        }
    }
}

/// `<stamp>_<stage>.tif`, stamp being seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputName {
    pub stamp: i64,
    pub stage: Stage,
}

impl OutputName {
    pub fn now(stage: Stage) -> Self {
        Self {
            stamp: chrono::Utc::now().timestamp(),
            stage,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.tif", self.stamp, self.stage.tag())
    }

    /// Recognise a file written by this pipeline
    pub fn parse(path: &Path) -> Option<Self> {
        if path.extension()?.to_str()? != "tif" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (stamp, tag) = stem.split_once('_')?;
        Some(Self {
            stamp: stamp.parse().ok()?,
            stage: Stage::from_tag(tag)?,
        })
    }

    pub fn with_stage(self, stage: Stage) -> Self {
        Self { stage, ..self }
    }
}

/// `(a - b) / (a + b)`; both zero gives NaN
pub fn normalized_difference<T: Float>(a: T, b: T) -> T {
    (a - b) / (a + b)
}

/// Per-pixel NDVI of two equally shaped bands
pub fn ndvi(nir: &Array2<f32>, red: &Array2<f32>) -> NdviResult<Array2<f32>> {
    if nir.dim() != red.dim() {
        return Err(NdviError::Processing(format!(
            "Band shapes differ: nir {:?}, red {:?}",
            nir.dim(),
            red.dim()
        )));
    }

    let mut out = Array2::<f32>::zeros(red.dim());
    let zip = Zip::from(&mut out).and(nir).and(red);

    #[cfg(feature = "parallel")]
    zip.par_for_each(|o, &n, &r| *o = normalized_difference(n, r));

    #[cfg(not(feature = "parallel"))]
    zip.for_each(|o, &n, &r| *o = normalized_difference(n, r));

    Ok(out)
}

/// Writes the vegetation index raster for a pair of band mosaics
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexComputer;

impl IndexComputer {
    pub fn new() -> Self {
        Self
    }

    /// Compute NDVI from the mosaics and write `<output_dir>/<epoch>_ndvi.tif`
    /// on the red mosaic's grid, tagged with `working_crs`.
    pub fn compute_index(
        &self,
        mosaics: &BandMosaics,
        working_crs: &str,
        output_dir: &Path,
    ) -> NdviResult<PathBuf> {
        log::info!(
            "Computing NDVI over {}x{} pixels",
            mosaics.red.width(),
            mosaics.red.height()
        );

        let index = ndvi(&mosaics.nir.data, &mosaics.red.data)?;

        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(OutputName::now(Stage::Ndvi).file_name());

        write_float_raster(
            &path,
            &index,
            &mosaics.red.transform,
            Some(CrsSource::Definition(working_crs)),
            None,
        )?;

        log::info!("NDVI written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_equal_bands_give_zero() {
        assert_eq!(normalized_difference(250.0_f64, 250.0), 0.0);
    }

    #[test]
    fn test_sign_follows_dominant_band() {
        let greener = normalized_difference(0.8_f64, 0.1);
        assert!(greener > 0.0 && greener < 1.0);

        let redder = normalized_difference(0.1_f64, 0.8);
        assert!(redder < 0.0 && redder > -1.0);
    }

    #[test]
    fn test_zero_denominator_is_nan() {
        assert!(normalized_difference(0.0_f32, 0.0).is_nan());
    }

    #[test]
    fn test_ndvi_array() {
        let nir = array![[300.0_f32, 0.0], [50.0, 100.0]];
        let red = array![[100.0_f32, 0.0], [150.0, 100.0]];
        let out = ndvi(&nir, &red).unwrap();

        assert_relative_eq!(out[[0, 0]], 0.5);
        assert!(out[[0, 1]].is_nan());
        assert_relative_eq!(out[[1, 0]], -0.5);
        assert_eq!(out[[1, 1]], 0.0);
    }

    #[test]
    fn test_ndvi_shape_mismatch() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(ndvi(&a, &b).is_err());
    }

    #[test]
    fn test_output_names() {
        let name = OutputName { stamp: 1_700_000_000, stage: Stage::Ndvi };
        assert_eq!(name.file_name(), "1700000000_ndvi.tif");

        let parsed = OutputName::parse(Path::new("/out/1700000000_ndvi.tif")).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(
            parsed.with_stage(Stage::ClippedNdvi).file_name(),
            "1700000000_clipped_ndvi.tif"
        );

        assert_eq!(
            OutputName::parse(Path::new("/out/1700000000_clipped_ndvi.tif")).map(|n| n.stage),
            Some(Stage::ClippedNdvi)
        );
        assert!(OutputName::parse(Path::new("/out/scene.tif")).is_none());
        assert!(OutputName::parse(Path::new("/out/1700000000_ndvi.png")).is_none());
    }
}
