//! HTTP Download Manager
//!
//! Streams bundle and archive downloads to disk with progress tracking.
//! Bytes land in a `.partial` sibling and are renamed into place only
//! once fully written and synced.

use futures_util::StreamExt;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Download result with metadata
#[derive(Debug)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Resource not found (404). The URL is likely wrong or expired: {url}")]
    NotFound { url: String },
    #[error("HTTP {status} downloading {url}")]
    Http { status: u16, url: String },
    #[error("Network error downloading {url}: {message}")]
    Network { url: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Download manager for update files
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `url` to `dest`, calling `on_progress(downloaded, total)`
    /// after every chunk. `total` is 0 when the server sends no length.
    ///
    /// On any failure the partial file is removed and `dest` is untouched.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        on_progress: F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(u64, u64),
    {
        let partial_path = partial_path(dest);
        let result = self.fetch(url, dest, &partial_path, on_progress).await;
        if result.is_err() {
            if let Err(e) = fs::remove_file(&partial_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not remove partial download {}: {}", partial_path.display(), e);
                }
            }
        }
        result
    }

    async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        partial_path: &Path,
        mut on_progress: F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(u64, u64),
    {
        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let network = |e: reqwest::Error| DownloadError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("bundlepush/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(network)?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(DownloadError::NotFound {
                    url: url.to_string(),
                })
            }
            status => {
                return Err(DownloadError::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        }

        let total_size = response.content_length().unwrap_or(0);
        let mut file = File::create(partial_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(network)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total_size);
        }

        if total_size > 0 && downloaded != total_size {
            return Err(DownloadError::Network {
                url: url.to_string(),
                message: format!("connection closed after {} of {} bytes", downloaded, total_size),
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(partial_path, dest).await?;
        tracing::debug!("Downloaded {} bytes from {} to {}", downloaded, url, dest.display());

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            bytes_downloaded: downloaded,
        })
    }
}

pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}
