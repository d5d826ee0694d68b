use crate::types::{NdviError, NdviResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Suffix of an extracted Sentinel-2 product folder
pub const SAFE_SUFFIX: &str = "SAFE";

/// Unpacks downloaded tile archives into product folders
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Product folder an archive is expected to unpack into
    pub fn expected_root(archive: &Path, destination_dir: &Path) -> NdviResult<PathBuf> {
        let stem = archive.file_stem().ok_or_else(|| {
            NdviError::InvalidInput(format!("Archive path has no file name: {}", archive.display()))
        })?;
        Ok(destination_dir.join(format!("{}.{}", stem.to_string_lossy(), SAFE_SUFFIX)))
    }

    /// Extract every archive into `destination_dir` and delete it afterwards.
    ///
    /// Archives that cannot be opened or extracted are logged and skipped;
    /// they are kept on disk and left out of the returned list.
    pub fn extract(&self, archives: &[PathBuf], destination_dir: &Path) -> Vec<PathBuf> {
        let mut extracted = Vec::with_capacity(archives.len());

        for archive in archives {
            match Self::extract_one(archive, destination_dir) {
                Ok(root) => {
                    log::info!("{} - file unzipped", archive.display());
                    extracted.push(root);
                }
                Err(e) => {
                    log::warn!("{} - not unzipped: {}", archive.display(), e);
                }
            }
        }

        log::info!("Extracted {} of {} archives", extracted.len(), archives.len());
        extracted
    }

    fn extract_one(archive_path: &Path, destination_dir: &Path) -> NdviResult<PathBuf> {
        let root = Self::expected_root(archive_path, destination_dir)?;

        {
            let file = File::open(archive_path)?;
            let mut archive = ZipArchive::new(file)
                .map_err(|e| NdviError::Archive(format!("Failed to open ZIP: {}", e)))?;

            log::debug!(
                "Extracting {} entries from {} into {}",
                archive.len(),
                archive_path.display(),
                destination_dir.display()
            );

            archive
                .extract(destination_dir)
                .map_err(|e| NdviError::Archive(format!("Failed to extract ZIP: {}", e)))?;
        }

        if !root.is_dir() {
            return Err(NdviError::Archive(format!(
                "archive did not contain expected folder {}",
                root.display()
            )));
        }

        std::fs::remove_file(archive_path)?;
        Ok(root)
    }
}
