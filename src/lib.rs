//! Bundlepush - Signed over-the-air bundle updates
//!
//! Asks an update server whether a newer bundle exists, verifies the
//! offer, installs it and activates it for the next process start.
//! The host owns the UI and the restart; this crate owns the decision
//! and everything on disk.

pub mod engine;

pub use engine::config::UpdaterConfig;
pub use engine::error::{ErrorKind, UpdateError};
pub use engine::updater::{
    InstallMode, InstalledBundle, SyncOptions, SyncOutcome, UpdateContext, UpdateHooks,
    UpdateOffer, UpdatePipeline,
};

/// File holding the key-value store inside the data directory.
pub const STORE_FILE_NAME: &str = "bundlepush.store.json";
