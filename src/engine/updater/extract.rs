//! Archive Extraction
//!
//! Unpacks downloaded update archives. Which format is supported is
//! decided once, from configuration, by `Capabilities`.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Archive extraction is not supported on this host")]
    Unsupported,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),
    #[error("Archive entry escapes destination: {0}")]
    UnsafeEntry(String),
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(e) => Self::Io(e),
            other => Self::InvalidArchive(other.to_string()),
        }
    }
}

/// Blocking extractor; callers run it off the async executor.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError>;

    fn name(&self) -> &'static str;
}

pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
        fs::create_dir_all(dest)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let relative = entry
                .enclosed_name()
                .ok_or_else(|| ExtractError::UnsafeEntry(entry.name().to_string()))?;
            let out_path = dest.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            out.sync_all()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "zip"
    }
}

pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let decoder = flate2::read::GzDecoder::new(File::open(archive)?);
        let mut tar = tar::Archive::new(decoder);
        fs::create_dir_all(dest)?;

        for entry in tar.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let relative = enclosed(&path)
                .ok_or_else(|| ExtractError::UnsafeEntry(path.display().to_string()))?;
            let out_path = dest.join(relative);

            if entry.header().entry_type().is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if !entry.header().entry_type().is_file() {
                // Links and devices have no place in a bundle
                tracing::debug!("Skipping non-file tar entry {}", path.display());
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            out.sync_all()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tar-gz"
    }
}

/// For hosts without any archive support.
pub struct NoExtractor;

impl ArchiveExtractor for NoExtractor {
    fn extract(&self, _archive: &Path, _dest: &Path) -> Result<(), ExtractError> {
        Err(ExtractError::Unsupported)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Relative path with no root, prefix or `..` components.
fn enclosed(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let encoder =
            flate2::write::GzEncoder::new(File::create(path).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_zip_extract_nested() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        write_zip(
            &archive,
            &[
                ("bundle.js", b"console.log(1)"),
                ("assets/logo.png", b"png"),
            ],
        );

        let dest = dir.path().join("extracted");
        ZipExtractor.extract(&archive, &dest).unwrap();

        assert_eq!(fs::read(dest.join("bundle.js")).unwrap(), b"console.log(1)");
        assert!(dest.join("assets").join("logo.png").exists());
    }

    #[test]
    fn test_zip_rejects_garbage() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let result = ZipExtractor.extract(&archive, &dir.path().join("out"));
        assert!(matches!(result, Err(ExtractError::InvalidArchive(_))));
    }

    #[test]
    fn test_zip_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        write_zip(&archive, &[("../escape.js", b"x")]);

        let result = ZipExtractor.extract(&archive, &dir.path().join("out"));
        assert!(matches!(result, Err(ExtractError::UnsafeEntry(_))));
        assert!(!dir.path().join("escape.js").exists());
    }

    #[test]
    fn test_tar_gz_extract() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("update.tar.gz");
        write_tar_gz(&archive, &[("dist/bundle.js", b"bundle")]);

        let dest = dir.path().join("extracted");
        TarGzExtractor.extract(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("dist").join("bundle.js")).unwrap(), b"bundle");
    }

    #[test]
    fn test_no_extractor() {
        let dir = tempdir().unwrap();
        let result = NoExtractor.extract(&dir.path().join("a.zip"), dir.path());
        assert!(matches!(result, Err(ExtractError::Unsupported)));
    }

    #[test]
    fn test_enclosed() {
        assert_eq!(enclosed(Path::new("a/b.js")), Some(PathBuf::from("a/b.js")));
        assert_eq!(enclosed(Path::new("./a.js")), Some(PathBuf::from("a.js")));
        assert_eq!(enclosed(Path::new("../a.js")), None);
        assert_eq!(enclosed(Path::new("/etc/passwd")), None);
        assert_eq!(enclosed(Path::new(".")), None);
    }
}
