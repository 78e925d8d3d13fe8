//! Bundle Update System
//!
//! Fetches signed bundles from the update server and activates them for
//! the next start without ever exposing a half-installed bundle.
//!
//! Components:
//! - `offer` - Offer and installed-bundle data
//! - `verify` - Signing payload and signature checks
//! - `checker` - Check protocol and trust policy
//! - `download` - Streaming HTTP download
//! - `extract` - Archive extraction strategies
//! - `bundle_dir` - On-disk bundle layout and activation record
//! - `installer` - Download, unpack, activate
//! - `state` - Install and pipeline state machines
//! - `pipeline` - Orchestration and host hooks

pub mod bundle_dir;
pub mod capabilities;
pub mod checker;
pub mod download;
pub mod extract;
pub mod installer;
pub mod offer;
pub mod pipeline;
pub mod state;
pub mod verify;

pub use bundle_dir::{ActivationRecord, BundleDirectory};
pub use capabilities::Capabilities;
pub use checker::UpdateChecker;
pub use installer::BundleInstaller;
pub use offer::{InstalledBundle, Platform, UpdateOffer};
pub use pipeline::{
    ExecRestarter, InstallMode, Restarter, SyncOptions, SyncOutcome, UpdateContext, UpdateHooks,
    UpdatePipeline,
};
pub use state::{InstallPhase, PipelineState};
pub use verify::TrustVerifier;
