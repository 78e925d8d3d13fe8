//! Pipeline error taxonomy
//!
//! Component errors convert into `UpdateError`, which is what the host's
//! `on_error` hook and every public pipeline operation see.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::engine::identity::IdentityError;
use crate::engine::updater::checker::CheckError;
use crate::engine::updater::download::DownloadError;
use crate::engine::updater::installer::InstallError;
use crate::engine::updater::offer::InstalledBundle;
use crate::engine::updater::pipeline::RestartError;

/// Why a download failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFailure {
    Transport,
    NotFound,
    Http(u16),
    Io,
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::NotFound => write!(f, "not found"),
            Self::Http(status) => write!(f, "HTTP {}", status),
            Self::Io => write!(f, "disk"),
        }
    }
}

/// Stable discriminant of `UpdateError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IdentityUnavailable,
    CheckFailed,
    SignatureRequired,
    SignatureInvalid,
    DownloadFailed,
    ExtractionFailed,
    ExtractionUnsupported,
    BundleNotFound,
    ActivationFailed,
    InvalidOffer,
    RestartFailed,
    Busy,
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Device identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Update check failed: {0}")]
    CheckFailed(String),

    #[error("Update is not signed. This app requires signed updates")]
    SignatureRequired,

    #[error("Update signature verification failed. Update may be compromised")]
    SignatureInvalid,

    #[error("Download failed ({kind}): {message}")]
    DownloadFailed {
        kind: DownloadFailure,
        message: String,
    },

    #[error("Failed to extract update: {0}")]
    ExtractionFailed(String),

    #[error("Archive extraction is not supported on this host")]
    ExtractionUnsupported,

    #[error("{file_name} not found in update archive (kept at {})", .dir.display())]
    BundleNotFound { file_name: String, dir: PathBuf },

    #[error("Could not persist activation: {message}")]
    ActivationFailed {
        bundle: Box<InstalledBundle>,
        message: String,
    },

    #[error("Invalid update offer: {0}")]
    InvalidOffer(String),

    #[error("Restart failed: {0}")]
    RestartFailed(String),

    #[error("Another update operation is already in progress")]
    Busy,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityUnavailable(_) => ErrorKind::IdentityUnavailable,
            Self::CheckFailed(_) => ErrorKind::CheckFailed,
            Self::SignatureRequired => ErrorKind::SignatureRequired,
            Self::SignatureInvalid => ErrorKind::SignatureInvalid,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Self::ExtractionUnsupported => ErrorKind::ExtractionUnsupported,
            Self::BundleNotFound { .. } => ErrorKind::BundleNotFound,
            Self::ActivationFailed { .. } => ErrorKind::ActivationFailed,
            Self::InvalidOffer(_) => ErrorKind::InvalidOffer,
            Self::RestartFailed(_) => ErrorKind::RestartFailed,
            Self::Busy => ErrorKind::Busy,
        }
    }

    /// Security rejections are never retried or downgraded.
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, Self::SignatureRequired | Self::SignatureInvalid)
    }
}

impl From<IdentityError> for UpdateError {
    fn from(e: IdentityError) -> Self {
        Self::IdentityUnavailable(e.to_string())
    }
}

impl From<CheckError> for UpdateError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::SignatureRequired => Self::SignatureRequired,
            CheckError::SignatureInvalid => Self::SignatureInvalid,
            CheckError::InvalidOffer(message) => Self::InvalidOffer(message),
            other => Self::CheckFailed(other.to_string()),
        }
    }
}

impl From<DownloadError> for UpdateError {
    fn from(e: DownloadError) -> Self {
        let kind = match &e {
            DownloadError::NotFound { .. } => DownloadFailure::NotFound,
            DownloadError::Http { status, .. } => DownloadFailure::Http(*status),
            DownloadError::Network { .. } => DownloadFailure::Transport,
            DownloadError::Io(_) => DownloadFailure::Io,
        };
        Self::DownloadFailed {
            kind,
            message: e.to_string(),
        }
    }
}

impl From<InstallError> for UpdateError {
    fn from(e: InstallError) -> Self {
        match e {
            InstallError::InvalidOffer(message) => Self::InvalidOffer(message),
            InstallError::Download(e) => e.into(),
            InstallError::ExtractionUnsupported => Self::ExtractionUnsupported,
            InstallError::Extraction(e) => Self::ExtractionFailed(e.to_string()),
            InstallError::BundleNotFound { file_name, dir } => {
                Self::BundleNotFound { file_name, dir }
            }
            InstallError::ActivationFailed { bundle, message } => {
                Self::ActivationFailed { bundle, message }
            }
            // Disk failures before activation leave nothing usable
            InstallError::Io(e) => Self::DownloadFailed {
                kind: DownloadFailure::Io,
                message: e.to_string(),
            },
        }
    }
}

impl From<RestartError> for UpdateError {
    fn from(e: RestartError) -> Self {
        Self::RestartFailed(e.to_string())
    }
}
