// Bundlepush Engine - Core module structure
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod storage;
pub mod updater;

pub use config::UpdaterConfig;
pub use error::{ErrorKind, UpdateError};
pub use identity::{DeviceIdentity, IdentityStore};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use updater::UpdatePipeline;
