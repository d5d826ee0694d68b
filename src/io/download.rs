use crate::types::{Credentials, NdviError, NdviResult, TileRecord, TileTable};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tile transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub chunk_size: usize,           // bytes per read
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,           // whole transfer, per tile
    pub show_progress: bool,
    pub value_suffix: String,        // appended to the catalog link to fetch the payload
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            connect_timeout_secs: 30,
            timeout_secs: 3600,
            show_progress: true,
            value_suffix: "$value".to_string(),
        }
    }
}

/// Streams tile archives to disk
pub struct TileDownloader {
    config: DownloadConfig,
    credentials: Credentials,
    client: reqwest::blocking::Client,
}

impl TileDownloader {
    pub fn new(credentials: Credentials, config: DownloadConfig) -> NdviResult<Self> {
        if config.chunk_size == 0 {
            return Err(NdviError::InvalidInput("chunk_size must be positive".to_string()));
        }

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            config,
            credentials,
            client,
        })
    }

    /// Payload URL for a tile
    pub fn payload_url(&self, record: &TileRecord) -> String {
        format!("{}{}", record.link, self.config.value_suffix)
    }

    /// Local archive path for a tile
    pub fn archive_path(destination_dir: &Path, record: &TileRecord) -> PathBuf {
        destination_dir.join(format!("{}.zip", record.tile_id))
    }

    /// Download every tile of `table` into `destination_dir`, in table order.
    ///
    /// The first failing tile aborts the whole download.
    pub fn download(&self, table: &TileTable, destination_dir: &Path) -> NdviResult<Vec<PathBuf>> {
        if table.is_empty() {
            return Err(NdviError::InvalidInput("no tiles selected for download".to_string()));
        }

        std::fs::create_dir_all(destination_dir)?;
        log::info!("Downloading {} tiles to {}", table.len(), destination_dir.display());

        let mut downloaded = Vec::with_capacity(table.len());
        for record in table {
            let target = Self::archive_path(destination_dir, record);
            log::info!("{}", record.tile_id);

            if let Err(e) = self.download_one(&self.payload_url(record), &target) {
                log::error!("Download of {} failed: {}", record.tile_id, e);
                return Err(e);
            }

            downloaded.push(target);
        }

        Ok(downloaded)
    }

    fn download_one(&self, url: &str, target: &Path) -> NdviResult<()> {
        let mut response = self
            .client
            .get(url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(NdviError::Transport {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let file = File::create(target)?;

        match self.stream_to_file(&mut response, file, total_size) {
            Ok(written) => {
                log::info!("Wrote {} bytes to {}", written, target.display());
                Ok(())
            }
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_file(target) {
                    log::warn!("Could not remove partial file {}: {}", target.display(), remove_err);
                }
                Err(e)
            }
        }
    }

    fn stream_to_file<R: Read>(&self, reader: &mut R, file: File, total_size: u64) -> NdviResult<u64> {
        let progress = self.progress_bar(total_size);
        let mut writer = BufWriter::new(file);

        let written = copy_chunked(reader, &mut writer, self.config.chunk_size, |n| {
            progress.inc(n as u64)
        });
        progress.finish_and_clear();
        let written = written?;
        writer.flush()?;

        if total_size > 0 && written != total_size {
            return Err(NdviError::Processing(format!(
                "transfer ended after {} of {} bytes",
                written, total_size
            )));
        }

        Ok(written)
    }

    fn progress_bar(&self, total_size: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(total_size);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}

/// Copy `reader` into `writer` in fixed-size chunks, reporting each chunk
pub fn copy_chunked<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    mut on_chunk: impl FnMut(usize),
) -> NdviResult<u64> {
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NdviError::Io(e)),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
        on_chunk(n);
    }

    Ok(total)
}
