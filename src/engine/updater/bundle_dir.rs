//! Bundle Directory
//!
//! On-disk layout for downloaded bundles and the activation record read
//! by the boot-time loader:
//!
//! ```text
//! <base>/bundles/version_<v>_<ts>/extracted/...   archive installs
//! <base>/bundles/bundle_<v>_<ts>.<ext>            separate-URL installs
//! <base>/bundles/assets_<v>_<ts>/                 separate-URL assets
//! <base>/active_bundle_path.txt                   absolute path of active bundle
//! <base>/active_bundle_version.txt                its version
//! ```
//!
//! Only the installer writes here.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const ACTIVE_PATH_RECORD: &str = "active_bundle_path.txt";
pub const ACTIVE_VERSION_RECORD: &str = "active_bundle_version.txt";
const BUNDLES_DIR: &str = "bundles";
const FAILED_MARKER: &str = ".failed";

#[derive(Error, Debug)]
pub enum BundleDirError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bundle file missing or empty: {0}")]
    BundleMissing(PathBuf),
}

/// Contents of the activation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    pub path: PathBuf,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BundleDirectory {
    base_dir: PathBuf,
}

impl BundleDirectory {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.base_dir.join(BUNDLES_DIR)
    }

    pub fn active_path_record(&self) -> PathBuf {
        self.base_dir.join(ACTIVE_PATH_RECORD)
    }

    pub fn active_version_record(&self) -> PathBuf {
        self.base_dir.join(ACTIVE_VERSION_RECORD)
    }

    pub async fn init(&self) -> Result<(), BundleDirError> {
        fs::create_dir_all(self.bundles_dir()).await?;
        Ok(())
    }

    /// Fresh directory for one archive install attempt.
    pub fn version_dir(&self, version: &str, stamp: i64) -> PathBuf {
        self.bundles_dir()
            .join(format!("version_{}_{}", sanitize(version), stamp))
    }

    /// Target file for a separately delivered bundle; keeps the
    /// extension of the configured bundle file name.
    pub fn separate_bundle_path(&self, version: &str, stamp: i64, bundle_file_name: &str) -> PathBuf {
        let name = match Path::new(bundle_file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("bundle_{}_{}.{}", sanitize(version), stamp, ext),
            None => format!("bundle_{}_{}", sanitize(version), stamp),
        };
        self.bundles_dir().join(name)
    }

    pub fn assets_dir(&self, version: &str, stamp: i64) -> PathBuf {
        self.bundles_dir()
            .join(format!("assets_{}_{}", sanitize(version), stamp))
    }

    /// Find `file_name` at the root of `extracted`, then one directory
    /// level down (subdirectories in name order).
    pub async fn locate_bundle(extracted: &Path, file_name: &str) -> Result<Option<PathBuf>, BundleDirError> {
        let at_root = extracted.join(file_name);
        if fs::metadata(&at_root).await.map(|m| m.is_file()).unwrap_or(false) {
            return Ok(Some(at_root));
        }

        let mut subdirs = Vec::new();
        let mut entries = fs::read_dir(extracted).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                subdirs.push(entry.path());
            }
        }
        subdirs.sort();

        for dir in subdirs {
            let candidate = dir.join(file_name);
            if fs::metadata(&candidate).await.map(|m| m.is_file()).unwrap_or(false) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Point the boot-time loader at `bundle_path`.
    ///
    /// The bundle must already be on disk and non-empty. Both records are
    /// staged before either is replaced; the path record is the commit
    /// point. On any error the previous records are left as they were.
    pub async fn write_activation(&self, bundle_path: &Path, version: &str) -> Result<(), BundleDirError> {
        let is_ready = fs::metadata(bundle_path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !is_ready {
            return Err(BundleDirError::BundleMissing(bundle_path.to_path_buf()));
        }

        let absolute = if bundle_path.is_absolute() {
            bundle_path.to_path_buf()
        } else {
            fs::canonicalize(bundle_path).await?
        };

        fs::create_dir_all(&self.base_dir).await?;
        let version_record = self.active_version_record();
        let path_record = self.active_path_record();
        let version_temp = temp_path(&version_record);
        let path_temp = temp_path(&path_record);

        let staged = async {
            stage(&version_temp, version).await?;
            stage(&path_temp, &absolute.to_string_lossy()).await
        }
        .await;
        if let Err(e) = staged {
            discard(&[version_temp.as_path(), path_temp.as_path()]).await;
            return Err(e.into());
        }

        let previous_version = fs::read_to_string(&version_record).await.ok();
        if let Err(e) = fs::rename(&version_temp, &version_record).await {
            discard(&[version_temp.as_path(), path_temp.as_path()]).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&path_temp, &path_record).await {
            discard(&[path_temp.as_path()]).await;
            self.restore_version(previous_version).await;
            return Err(e.into());
        }

        tracing::info!("Activated bundle {} ({})", absolute.display(), version);
        Ok(())
    }

    async fn restore_version(&self, previous: Option<String>) {
        let record = self.active_version_record();
        let result = match previous {
            Some(version) => write_atomic(&record, &version).await,
            None => match fs::remove_file(&record).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            tracing::warn!("Could not restore previous version record: {}", e);
        }
    }

    /// Read the activation record. Missing, empty or unreadable records
    /// all mean "no downloaded bundle".
    pub async fn read_activation(&self) -> Option<ActivationRecord> {
        let content = match fs::read_to_string(self.active_path_record()).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not read activation record: {}", e);
                }
                return None;
            }
        };
        let path = content.trim();
        if path.is_empty() {
            return None;
        }

        let version = fs::read_to_string(self.active_version_record())
            .await
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Some(ActivationRecord {
            path: PathBuf::from(path),
            version,
        })
    }

    /// Remove both records, reverting to the shipped bundle.
    pub async fn clear_activation(&self) -> Result<(), BundleDirError> {
        for record in [self.active_path_record(), self.active_version_record()] {
            match fs::remove_file(&record).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete every stored artifact whose name does not contain
    /// `keep_version`. Per-entry failures are logged and skipped.
    /// Returns the number of entries removed.
    pub async fn clear_old_bundles(&self, keep_version: &str) -> usize {
        let keep = sanitize(keep_version);
        let mut entries = match fs::read_dir(self.bundles_dir()).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Error clearing old bundles: {}", e);
                }
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Error clearing old bundles: {}", e);
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(&keep) {
                continue;
            }
            match remove_path(&entry.path()).await {
                Ok(()) => {
                    tracing::debug!("Removed old bundle artifact {}", name);
                    removed += 1;
                }
                Err(e) => tracing::warn!("Could not remove old bundle artifact {}: {}", name, e),
            }
        }
        removed
    }

    /// First stored artifact whose name contains `version`.
    pub async fn local_bundle_path(&self, version: &str) -> Option<PathBuf> {
        let needle = sanitize(version);
        let mut entries = fs::read_dir(self.bundles_dir()).await.ok()?;
        let mut matches = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().contains(&needle) {
                matches.push(entry.path());
            }
        }
        matches.sort();
        matches.into_iter().next()
    }

    /// Names of stored artifacts, sorted.
    pub async fn list_entries(&self) -> Result<Vec<String>, BundleDirError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(self.bundles_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Leave a failed attempt's directory in place, flagged for diagnostics.
    pub async fn mark_failed(dir: &Path, reason: &str) -> Result<(), BundleDirError> {
        fs::write(dir.join(FAILED_MARKER), reason).await?;
        Ok(())
    }

    pub async fn is_marked_failed(dir: &Path) -> bool {
        fs::metadata(dir.join(FAILED_MARKER)).await.is_ok()
    }
}

/// Keep version strings safe as path components.
pub fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

fn temp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Write and sync `content` to `temp`.
async fn stage(temp: &Path, content: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await
}

async fn discard(temps: &[&Path]) {
    for temp in temps {
        let _ = fs::remove_file(temp).await;
    }
}

/// Write through a synced temp file and rename over `path`.
async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let temp = temp_path(path);
    stage(&temp, content).await?;
    fs::rename(&temp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn bundle_dir() -> (tempfile::TempDir, BundleDirectory) {
        let dir = tempdir().unwrap();
        let bundles = BundleDirectory::new(dir.path());
        bundles.init().await.unwrap();
        (dir, bundles)
    }

    #[tokio::test]
    async fn test_init_creates_layout() {
        let (_dir, bundles) = bundle_dir().await;
        assert!(bundles.bundles_dir().is_dir());
        assert!(bundles.read_activation().await.is_none());
    }

    #[test]
    fn test_paths_are_version_scoped() {
        let bundles = BundleDirectory::new("/data");
        assert_eq!(
            bundles.version_dir("2.0.0", 17),
            PathBuf::from("/data/bundles/version_2.0.0_17")
        );
        assert_eq!(
            bundles.separate_bundle_path("2.0.0", 17, "bundle.js"),
            PathBuf::from("/data/bundles/bundle_2.0.0_17.js")
        );
        assert_eq!(
            bundles.separate_bundle_path("1/../x", 3, "main"),
            PathBuf::from("/data/bundles/bundle_1_.._x_3")
        );
    }

    #[tokio::test]
    async fn test_locate_bundle_root_then_nested() {
        let (dir, _bundles) = bundle_dir().await;
        let extracted = dir.path().join("extracted");
        std::fs::create_dir_all(extracted.join("b-dist")).unwrap();
        std::fs::create_dir_all(extracted.join("a-empty")).unwrap();
        std::fs::write(extracted.join("b-dist").join("bundle.js"), "nested").unwrap();

        let found = BundleDirectory::locate_bundle(&extracted, "bundle.js").await.unwrap();
        assert_eq!(found, Some(extracted.join("b-dist").join("bundle.js")));

        std::fs::write(extracted.join("bundle.js"), "root").unwrap();
        let found = BundleDirectory::locate_bundle(&extracted, "bundle.js").await.unwrap();
        assert_eq!(found, Some(extracted.join("bundle.js")));
    }

    #[tokio::test]
    async fn test_locate_bundle_only_one_level_deep() {
        let (dir, _bundles) = bundle_dir().await;
        let extracted = dir.path().join("extracted");
        std::fs::create_dir_all(extracted.join("a").join("b")).unwrap();
        std::fs::write(extracted.join("a").join("b").join("bundle.js"), "deep").unwrap();

        let found = BundleDirectory::locate_bundle(&extracted, "bundle.js").await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_activation_roundtrip() {
        let (_dir, bundles) = bundle_dir().await;
        let bundle = bundles.bundles_dir().join("bundle_2.0.0_1.js");
        std::fs::write(&bundle, "code").unwrap();

        bundles.write_activation(&bundle, "2.0.0").await.unwrap();
        let record = bundles.read_activation().await.unwrap();
        assert_eq!(record.path, bundle);
        assert_eq!(record.version.as_deref(), Some("2.0.0"));
        assert!(!bundles.active_path_record().with_extension("tmp").exists());

        bundles.clear_activation().await.unwrap();
        assert!(bundles.read_activation().await.is_none());
        // Clearing twice is fine
        bundles.clear_activation().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_staging_keeps_previous_activation() {
        let (_dir, bundles) = bundle_dir().await;
        let old_bundle = bundles.bundles_dir().join("bundle_2.0.0_1.js");
        let new_bundle = bundles.bundles_dir().join("bundle_3.0.0_2.js");
        std::fs::write(&old_bundle, "v2").unwrap();
        std::fs::write(&new_bundle, "v3").unwrap();
        bundles.write_activation(&old_bundle, "2.0.0").await.unwrap();

        // The path record cannot be staged
        let blocked = bundles.active_path_record().with_extension("tmp");
        std::fs::create_dir_all(&blocked).unwrap();

        assert!(bundles.write_activation(&new_bundle, "3.0.0").await.is_err());
        let record = bundles.read_activation().await.unwrap();
        assert_eq!(record.path, old_bundle);
        assert_eq!(record.version.as_deref(), Some("2.0.0"));
        assert!(!bundles.active_version_record().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_commit_restores_version_record() {
        let (_dir, bundles) = bundle_dir().await;
        let bundle = bundles.bundles_dir().join("bundle_3.0.0_2.js");
        std::fs::write(&bundle, "v3").unwrap();

        // A non-empty directory where the path record belongs cannot be
        // renamed over
        let path_record = bundles.active_path_record();
        std::fs::create_dir_all(&path_record).unwrap();
        std::fs::write(path_record.join("keep"), "x").unwrap();

        assert!(bundles.write_activation(&bundle, "3.0.0").await.is_err());
        assert!(!bundles.active_version_record().exists());
        assert!(!path_record.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_activation_refuses_missing_or_empty_bundle() {
        let (_dir, bundles) = bundle_dir().await;
        let missing = bundles.bundles_dir().join("nope.js");
        assert!(matches!(
            bundles.write_activation(&missing, "1.0.0").await,
            Err(BundleDirError::BundleMissing(_))
        ));

        let empty = bundles.bundles_dir().join("empty.js");
        std::fs::write(&empty, "").unwrap();
        assert!(bundles.write_activation(&empty, "1.0.0").await.is_err());
        assert!(bundles.read_activation().await.is_none());
    }

    #[tokio::test]
    async fn test_read_activation_trims_and_ignores_blank() {
        let (_dir, bundles) = bundle_dir().await;
        std::fs::write(bundles.active_path_record(), "   \n").unwrap();
        assert!(bundles.read_activation().await.is_none());

        std::fs::write(bundles.active_path_record(), "  /data/bundle.js\n").unwrap();
        let record = bundles.read_activation().await.unwrap();
        assert_eq!(record.path, PathBuf::from("/data/bundle.js"));
        assert_eq!(record.version, None);
    }

    #[tokio::test]
    async fn test_clear_old_bundles() {
        let (_dir, bundles) = bundle_dir().await;
        let root = bundles.bundles_dir();
        std::fs::create_dir_all(root.join("version_1.0.0_1").join("extracted")).unwrap();
        std::fs::create_dir_all(root.join("version_2.0.0_2")).unwrap();
        std::fs::write(root.join("bundle_1.5.0_3.js"), "x").unwrap();
        std::fs::write(root.join("bundle_2.0.0_4.js"), "x").unwrap();
        std::fs::create_dir_all(root.join("assets_1.5.0_3")).unwrap();

        let removed = bundles.clear_old_bundles("2.0.0").await;
        assert_eq!(removed, 3);
        assert_eq!(
            bundles.list_entries().await.unwrap(),
            vec!["bundle_2.0.0_4.js", "version_2.0.0_2"]
        );
    }

    #[tokio::test]
    async fn test_clear_old_bundles_without_directory() {
        let dir = tempdir().unwrap();
        let bundles = BundleDirectory::new(dir.path().join("never-created"));
        assert_eq!(bundles.clear_old_bundles("1.0.0").await, 0);
    }

    #[tokio::test]
    async fn test_local_bundle_path_and_failed_marker() {
        let (_dir, bundles) = bundle_dir().await;
        let version_dir = bundles.version_dir("3.1.0", 9);
        std::fs::create_dir_all(&version_dir).unwrap();

        assert_eq!(bundles.local_bundle_path("3.1.0").await, Some(version_dir.clone()));
        assert_eq!(bundles.local_bundle_path("9.9.9").await, None);

        assert!(!BundleDirectory::is_marked_failed(&version_dir).await);
        BundleDirectory::mark_failed(&version_dir, "bundle.js not found").await.unwrap();
        assert!(BundleDirectory::is_marked_failed(&version_dir).await);
    }
}
