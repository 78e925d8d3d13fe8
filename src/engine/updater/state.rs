//! Update State Machines
//!
//! Explicit states for one installation attempt and for the pipeline as
//! a whole, so a half-finished install can never look committed.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A state enum with a transition table.
pub trait Phase: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn allows(&self, next: &Self) -> bool;
}

/// Phase of a single installation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum InstallPhase {
    Idle,
    Downloading {
        progress: f32,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    Extracting,
    Locating,
    Activating,
    Committed { version: String },
    Failed { reason: String },
}

impl Default for InstallPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl InstallPhase {
    pub fn downloading(bytes_downloaded: u64, total_bytes: u64) -> Self {
        let progress = if total_bytes > 0 {
            (bytes_downloaded as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };
        Self::Downloading {
            progress,
            bytes_downloaded,
            total_bytes,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Failed { .. })
    }
}

impl Phase for InstallPhase {
    fn allows(&self, next: &Self) -> bool {
        use InstallPhase::*;
        match (self, next) {
            // Every attempt starts over from Downloading
            (Idle | Committed { .. } | Failed { .. }, Downloading { .. }) => true,
            (Downloading { .. }, Downloading { .. } | Extracting | Locating) => true,
            (Extracting, Locating) => true,
            (Locating, Activating) => true,
            (Activating, Committed { .. }) => true,
            (current, Failed { .. }) => !current.is_terminal() && *current != Idle,
            _ => false,
        }
    }
}

/// Public state of the pipeline. Never terminal: every outcome returns
/// to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable { version: String },
    Downloading { version: String },
    Installed { version: String },
    Error { message: String },
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

impl Phase for PipelineState {
    fn allows(&self, next: &Self) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Checking) => true,
            (Checking, NoUpdate | UpdateAvailable { .. } | Error { .. }) => true,
            // A host may download an offer it obtained earlier
            (Idle | UpdateAvailable { .. }, Downloading { .. }) => true,
            (Downloading { .. }, Installed { .. } | Error { .. }) => true,
            (NoUpdate | UpdateAvailable { .. } | Installed { .. } | Error { .. }, Idle) => true,
            _ => false,
        }
    }
}

/// Holds the current phase and broadcasts every change.
pub struct PhaseTracker<S: Phase> {
    tx: watch::Sender<S>,
}

impl<S: Phase> PhaseTracker<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Move to `next`. Returns false, and stays put, if the table does
    /// not allow it.
    pub fn advance(&self, next: S) -> bool {
        let mut applied = true;
        self.tx.send_if_modified(|current| {
            if current.allows(&next) {
                *current = next.clone();
                true
            } else {
                applied = false;
                false
            }
        });
        if !applied {
            tracing::error!("Illegal transition {:?} -> {:?}", self.current(), next);
        }
        applied
    }

    /// Unconditionally move to `next`.
    pub fn reset(&self, next: S) {
        self.tx.send_replace(next);
    }
}

impl<S: Phase + Default> Default for PhaseTracker<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}
