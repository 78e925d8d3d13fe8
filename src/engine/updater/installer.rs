//! Bundle Installer
//!
//! Downloads, unpacks and activates a verified offer. Owns the bundle
//! directory: nothing else writes there. Partial state of a failed or
//! abandoned attempt is removed and never becomes the active bundle.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use super::bundle_dir::{remove_path, BundleDirError, BundleDirectory};
use super::download::{partial_path, DownloadError, Downloader};
use super::extract::{ArchiveExtractor, ExtractError};
use super::offer::{Delivery, InstalledBundle, UpdateOffer};
use super::state::{InstallPhase, PhaseTracker};
use crate::engine::storage::KeyValueStore;

pub const ACTIVE_BUNDLE_KEY: &str = "activeBundle";
const ARCHIVE_FILE_NAME: &str = "update.archive";
const EXTRACTED_DIR: &str = "extracted";
const ASSETS_DIR: &str = "assets";

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Invalid update offer: {0}")]
    InvalidOffer(String),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("Archive extraction is not supported on this host")]
    ExtractionUnsupported,
    #[error("Failed to extract archive: {0}")]
    Extraction(ExtractError),
    #[error("{file_name} not found in extracted archive at {}", .dir.display())]
    BundleNotFound { file_name: String, dir: PathBuf },
    #[error("Could not persist activation record: {message}")]
    ActivationFailed {
        /// Usable for this process, gone after a restart
        bundle: Box<InstalledBundle>,
        message: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<BundleDirError> for InstallError {
    fn from(e: BundleDirError) -> Self {
        match e {
            BundleDirError::Io(e) => Self::Io(e),
            BundleDirError::BundleMissing(path) => Self::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bundle missing at {}", path.display()),
            )),
        }
    }
}

impl From<ExtractError> for InstallError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Unsupported => Self::ExtractionUnsupported,
            other => Self::Extraction(other),
        }
    }
}

/// Paths created by the running attempt. Removed on failure, and on
/// drop if the attempt future is discarded before finishing.
#[derive(Default)]
struct AttemptGuard {
    paths: Vec<PathBuf>,
}

impl AttemptGuard {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    fn disarm(&mut self) {
        self.paths.clear();
    }

    async fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = remove_path(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Could not clean up {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        let paths = std::mem::take(&mut self.paths);
        tracing::debug!("Cleaning up {} paths of an abandoned install", paths.len());
        let remove = move || {
            for path in paths {
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(e) = result {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!("Could not clean up {}: {}", path.display(), e);
                    }
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

pub struct BundleInstaller {
    dir: BundleDirectory,
    downloader: Downloader,
    extractor: Arc<dyn ArchiveExtractor>,
    cache: Arc<dyn KeyValueStore>,
    bundle_file_name: String,
    phase: PhaseTracker<InstallPhase>,
    attempt: Mutex<()>,
}

impl BundleInstaller {
    pub fn new(
        dir: BundleDirectory,
        downloader: Downloader,
        extractor: Arc<dyn ArchiveExtractor>,
        cache: Arc<dyn KeyValueStore>,
        bundle_file_name: impl Into<String>,
    ) -> Self {
        Self {
            dir,
            downloader,
            extractor,
            cache,
            bundle_file_name: bundle_file_name.into(),
            phase: PhaseTracker::default(),
            attempt: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &BundleDirectory {
        &self.dir
    }

    pub fn phase(&self) -> InstallPhase {
        self.phase.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallPhase> {
        self.phase.subscribe()
    }

    /// Install a trusted offer and make it the bundle loaded on next start.
    ///
    /// Attempts are serialised; a second caller waits for the first.
    pub async fn install(&self, offer: &UpdateOffer) -> Result<InstalledBundle, InstallError> {
        let delivery = offer.delivery().ok_or_else(|| {
            InstallError::InvalidOffer("neither zipUrl nor bundleUrl is provided".to_string())
        })?;
        if offer.version.trim().is_empty() {
            return Err(InstallError::InvalidOffer("version is missing".to_string()));
        }

        let _attempt = self.attempt.lock().await;
        self.dir.init().await?;

        let stamp = Utc::now().timestamp_millis();
        let mut guard = AttemptGuard::default();
        self.phase.advance(InstallPhase::downloading(0, 0));

        let result = match delivery {
            Delivery::Archive { zip_url } => {
                self.install_archive(offer, zip_url, stamp, &mut guard).await
            }
            Delivery::Separate {
                bundle_url,
                assets_url,
            } => {
                self.install_separate(offer, bundle_url, assets_url, stamp, &mut guard)
                    .await
            }
        };

        match result {
            Ok(bundle) => {
                guard.disarm();
                self.phase.advance(InstallPhase::Committed {
                    version: bundle.version.clone(),
                });
                tracing::info!(
                    "Installed bundle {} at {}",
                    bundle.version,
                    bundle.local_path.display()
                );

                let removed = self.dir.clear_old_bundles(&bundle.version).await;
                if removed > 0 {
                    tracing::debug!("Removed {} old bundle artifacts", removed);
                }
                Ok(bundle)
            }
            Err(e) => {
                guard.cleanup().await;
                tracing::error!("Install of {} failed: {}", offer.version, e);
                self.phase.advance(InstallPhase::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn install_archive(
        &self,
        offer: &UpdateOffer,
        zip_url: &str,
        stamp: i64,
        guard: &mut AttemptGuard,
    ) -> Result<InstalledBundle, InstallError> {
        let version_dir = self.dir.version_dir(&offer.version, stamp);
        guard.track(version_dir.clone());
        tokio::fs::create_dir_all(&version_dir).await?;

        let archive_path = version_dir.join(ARCHIVE_FILE_NAME);
        let extracted = version_dir.join(EXTRACTED_DIR);

        tracing::info!("Downloading archive from {}", zip_url);
        self.download(zip_url, &archive_path).await?;

        self.phase.advance(InstallPhase::Extracting);
        self.extract(&archive_path, &extracted).await?;

        // Only now that extraction succeeded
        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            tracing::warn!("Could not remove archive {}: {}", archive_path.display(), e);
        }

        self.phase.advance(InstallPhase::Locating);
        let located = BundleDirectory::locate_bundle(&extracted, &self.bundle_file_name).await?;
        let Some(bundle_path) = located else {
            let reason = format!("{} not found in extracted archive", self.bundle_file_name);
            if let Err(e) = BundleDirectory::mark_failed(&version_dir, &reason).await {
                tracing::warn!("Could not mark {} as failed: {}", version_dir.display(), e);
            }
            guard.keep(&version_dir);
            return Err(InstallError::BundleNotFound {
                file_name: self.bundle_file_name.clone(),
                dir: version_dir,
            });
        };
        tracing::debug!("Bundle found at {}", bundle_path.display());

        let assets = bundle_path
            .parent()
            .map(|p| p.join(ASSETS_DIR))
            .filter(|p| p.is_dir());
        if let Some(assets) = &assets {
            tracing::debug!("Assets found at {}", assets.display());
        }

        self.activate(offer, bundle_path, assets, guard).await
    }

    async fn install_separate(
        &self,
        offer: &UpdateOffer,
        bundle_url: &str,
        assets_url: Option<&str>,
        stamp: i64,
        guard: &mut AttemptGuard,
    ) -> Result<InstalledBundle, InstallError> {
        let bundle_path = self
            .dir
            .separate_bundle_path(&offer.version, stamp, &self.bundle_file_name);
        guard.track(bundle_path.clone());
        guard.track(partial_path(&bundle_path));

        tracing::info!("Downloading bundle from {}", bundle_url);
        self.download(bundle_url, &bundle_path).await?;

        let assets = match assets_url {
            Some(assets_url) => {
                let assets_dir = self.dir.assets_dir(&offer.version, stamp);
                guard.track(assets_dir.clone());
                tokio::fs::create_dir_all(&assets_dir).await?;

                let archive_path = assets_dir.join(ARCHIVE_FILE_NAME);
                tracing::info!("Downloading assets from {}", assets_url);
                self.download(assets_url, &archive_path).await?;

                self.phase.advance(InstallPhase::Extracting);
                self.extract(&archive_path, &assets_dir).await?;
                if let Err(e) = tokio::fs::remove_file(&archive_path).await {
                    tracing::warn!("Could not remove archive {}: {}", archive_path.display(), e);
                }
                Some(assets_dir)
            }
            None => None,
        };

        self.phase.advance(InstallPhase::Locating);
        self.activate(offer, bundle_path, assets, guard).await
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        let phase = &self.phase;
        let mut last_logged = 0u64;
        let result = self
            .downloader
            .download(url, dest, |downloaded, total| {
                phase.advance(InstallPhase::downloading(downloaded, total));
                if total > 0 {
                    let percent = downloaded * 100 / total;
                    if percent >= last_logged + 10 {
                        last_logged = percent;
                        tracing::debug!("Download progress: {}%", percent);
                    }
                }
            })
            .await?;
        tracing::debug!("Downloaded {} bytes to {}", result.bytes_downloaded, result.path.display());
        Ok(())
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), InstallError> {
        let extractor = self.extractor.clone();
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &dest))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    /// Checksum the bundle, then write the activation record.
    async fn activate(
        &self,
        offer: &UpdateOffer,
        bundle_path: PathBuf,
        assets_path: Option<PathBuf>,
        guard: &mut AttemptGuard,
    ) -> Result<InstalledBundle, InstallError> {
        let checksum_path = bundle_path.clone();
        let sha256 = tokio::task::spawn_blocking(move || sha256_file(&checksum_path))
            .await
            .map_err(io::Error::other)??;

        let bundle = InstalledBundle {
            version: offer.version.clone(),
            local_path: bundle_path,
            assets_path,
            installed_at: Utc::now(),
            sha256,
            update_id: offer.update_id.clone(),
        };

        self.phase.advance(InstallPhase::Activating);
        if let Err(e) = self
            .dir
            .write_activation(&bundle.local_path, &bundle.version)
            .await
        {
            // The files stay: the bundle is still usable for this process
            guard.disarm();
            return Err(InstallError::ActivationFailed {
                bundle: Box::new(bundle),
                message: e.to_string(),
            });
        }

        self.mirror(&bundle).await;
        Ok(bundle)
    }

    async fn mirror(&self, bundle: &InstalledBundle) {
        let result = match serde_json::to_string(bundle) {
            Ok(json) => self.cache.set(ACTIVE_BUNDLE_KEY, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Could not mirror active bundle into cache: {}", e);
        }
    }

    /// Remove every stored artifact not belonging to `keep_version`.
    pub async fn clear_old_bundles(&self, keep_version: &str) -> usize {
        let _attempt = self.attempt.lock().await;
        self.dir.clear_old_bundles(keep_version).await
    }

    /// Path of the active downloaded bundle, if it still exists. A record
    /// pointing at a missing file is cleared.
    pub async fn downloaded_bundle_path(&self) -> Option<PathBuf> {
        let record = self.dir.read_activation().await?;
        if tokio::fs::metadata(&record.path).await.is_ok() {
            return Some(record.path);
        }

        tracing::warn!(
            "Stored bundle path {} does not exist, clearing it",
            record.path.display()
        );
        if let Err(e) = self.clear_activation().await {
            tracing::warn!("Could not clear stale activation record: {}", e);
        }
        None
    }

    /// The active bundle, served from the fast-access cache when it
    /// agrees with the durable record.
    pub async fn active_bundle(&self) -> Option<InstalledBundle> {
        let path = self.downloaded_bundle_path().await?;

        if let Ok(Some(json)) = self.cache.get(ACTIVE_BUNDLE_KEY).await {
            if let Ok(cached) = serde_json::from_str::<InstalledBundle>(&json) {
                if cached.local_path == path {
                    return Some(cached);
                }
            }
        }

        // Cache missing or stale: rebuild from the record
        let record = self.dir.read_activation().await?;
        let installed_at = tokio::fs::metadata(self.dir.active_path_record())
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let checksum_path = path.clone();
        let sha256 = tokio::task::spawn_blocking(move || sha256_file(&checksum_path))
            .await
            .ok()?
            .ok()?;

        let bundle = InstalledBundle {
            version: record.version.unwrap_or_default(),
            local_path: path,
            assets_path: None,
            installed_at,
            sha256,
            update_id: None,
        };
        self.mirror(&bundle).await;
        Some(bundle)
    }

    /// Revert to the bundle shipped with the app.
    pub async fn clear_activation(&self) -> Result<(), InstallError> {
        self.dir.clear_activation().await?;
        if let Err(e) = self.cache.remove(ACTIVE_BUNDLE_KEY).await {
            tracing::warn!("Could not clear cached active bundle: {}", e);
        }
        tracing::info!("Cleared stored bundle path");
        Ok(())
    }

    pub async fn local_bundle_path(&self, version: &str) -> Option<PathBuf> {
        self.dir.local_bundle_path(version).await
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::MemoryStore;
    use crate::engine::updater::extract::{NoExtractor, ZipExtractor};
    use std::io::Write;
    use tempfile::tempdir;

    fn installer(base: &Path, extractor: Arc<dyn ArchiveExtractor>) -> BundleInstaller {
        BundleInstaller::new(
            BundleDirectory::new(base),
            Downloader::new(reqwest::Client::new()),
            extractor,
            Arc::new(MemoryStore::new()),
            "bundle.js",
        )
    }

    #[test]
    fn test_sha256_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_offer_without_delivery_is_rejected() {
        let dir = tempdir().unwrap();
        let installer = installer(dir.path(), Arc::new(ZipExtractor));
        let offer = UpdateOffer {
            has_update: true,
            version: "1.0.0".to_string(),
            ..Default::default()
        };

        let result = installer.install(&offer).await;
        assert!(matches!(result, Err(InstallError::InvalidOffer(_))));
        assert_eq!(installer.phase(), InstallPhase::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_archive_cleans_up() {
        let dir = tempdir().unwrap();
        let installer = installer(dir.path(), Arc::new(ZipExtractor));
        let offer = UpdateOffer {
            has_update: true,
            version: "1.0.0".to_string(),
            zip_url: Some("http://127.0.0.1:1/u.zip".to_string()),
            ..Default::default()
        };

        let result = installer.install(&offer).await;
        assert!(matches!(
            result,
            Err(InstallError::Download(DownloadError::Network { .. }))
        ));
        assert!(installer.directory().list_entries().await.unwrap().is_empty());
        assert!(installer.directory().read_activation().await.is_none());
        assert!(matches!(installer.phase(), InstallPhase::Failed { .. }));
    }

    #[test]
    fn test_extract_error_mapping() {
        assert!(matches!(
            InstallError::from(ExtractError::Unsupported),
            InstallError::ExtractionUnsupported
        ));
        assert!(matches!(
            InstallError::from(ExtractError::InvalidArchive("x".to_string())),
            InstallError::Extraction(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_record_is_cleared() {
        let dir = tempdir().unwrap();
        let installer = installer(dir.path(), Arc::new(NoExtractor));
        let bundles = installer.directory().clone();
        bundles.init().await.unwrap();

        let bundle = bundles.bundles_dir().join("bundle_1.0.0_1.js");
        std::fs::write(&bundle, "code").unwrap();
        bundles.write_activation(&bundle, "1.0.0").await.unwrap();
        assert_eq!(installer.downloaded_bundle_path().await, Some(bundle.clone()));

        std::fs::remove_file(&bundle).unwrap();
        assert_eq!(installer.downloaded_bundle_path().await, None);
        assert!(bundles.read_activation().await.is_none());
    }

    #[tokio::test]
    async fn test_active_bundle_rebuilt_without_cache() {
        let dir = tempdir().unwrap();
        let installer = installer(dir.path(), Arc::new(ZipExtractor));
        let bundles = installer.directory().clone();
        bundles.init().await.unwrap();

        let bundle = bundles.bundles_dir().join("bundle_1.2.0_1.js");
        std::fs::write(&bundle, "hello world").unwrap();
        bundles.write_activation(&bundle, "1.2.0").await.unwrap();

        let active = installer.active_bundle().await.unwrap();
        assert_eq!(active.version, "1.2.0");
        assert_eq!(active.local_path, bundle);
        assert_eq!(
            active.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        installer.clear_activation().await.unwrap();
        assert!(installer.active_bundle().await.is_none());
    }

    #[tokio::test]
    async fn test_guard_removes_paths_on_drop() {
        let dir = tempdir().unwrap();
        let tracked = dir.path().join("version_1.0.0_1");
        std::fs::create_dir_all(tracked.join("extracted")).unwrap();

        {
            let mut guard = AttemptGuard::default();
            guard.track(tracked.clone());
        }
        // Removal runs on the blocking pool
        for _ in 0..50 {
            if !tracked.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!tracked.exists());
    }
}
