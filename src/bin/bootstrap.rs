//! Bundlepush Bootstrapper
//!
//! Resolves which bundle the host should load at process start and
//! prints its path on stdout. Run before the host's JS runtime starts.
//!
//! ## Responsibilities
//! 1. Read the activation record from the bundle directory
//! 2. Check the recorded bundle still exists
//! 3. Discard a stale record
//! 4. Fall back to the bundle shipped with the app
//!
//! It never installs anything and never touches the bundle directory
//! except to discard a stale record.

use bundlepush_lib::engine::config::{UpdaterConfig, CONFIG_FILE_NAME};
use bundlepush_lib::engine::updater::BundleDirectory;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SHIPPED_BUNDLE: &str = "index.bundle";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    // Without a config there is nothing downloaded to find
    let config = match UpdaterConfig::load_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{}; using the shipped bundle", e);
            println!("{}", DEFAULT_SHIPPED_BUNDLE);
            return ExitCode::SUCCESS;
        }
    };

    let Ok(data_dir) = config.resolved_data_dir() else {
        tracing::warn!("Could not determine data directory; using the shipped bundle");
        println!("{}", config.shipped_bundle_name);
        return ExitCode::SUCCESS;
    };

    println!("{}", resolve_bundle(&BundleDirectory::new(data_dir), &config.shipped_bundle_name).await);
    ExitCode::SUCCESS
}

/// Path of the active downloaded bundle, or the shipped bundle name.
async fn resolve_bundle(dir: &BundleDirectory, shipped: &str) -> String {
    let Some(record) = dir.read_activation().await else {
        return shipped.to_string();
    };

    match tokio::fs::metadata(&record.path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            tracing::debug!(
                "Loading downloaded bundle {} ({})",
                record.path.display(),
                record.version.as_deref().unwrap_or("unknown version")
            );
            record.path.display().to_string()
        }
        _ => {
            tracing::warn!(
                "Recorded bundle {} is missing, falling back to {}",
                record.path.display(),
                shipped
            );
            if let Err(e) = dir.clear_activation().await {
                tracing::warn!("Could not discard stale activation record: {}", e);
            }
            shipped.to_string()
        }
    }
}
