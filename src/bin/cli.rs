//! Bundlepush CLI - Main entry point for CLI binary
//!
//! Drives the update pipeline from a terminal or a host's shell scripts.

use anyhow::{anyhow, Context, Result};
use bundlepush_lib::engine::{
    cli::{
        formatter::{format_size, CliFormatter},
        Cli, Commands, OutputFormat,
    },
    config::UpdaterConfig,
    storage::FileStore,
    updater::{
        ExecRestarter, InstallMode, InstallPhase, SyncOptions, SyncOutcome, UpdateContext,
        UpdateHooks, UpdatePipeline,
    },
};
use bundlepush_lib::STORE_FILE_NAME;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let json_output = cli.format == OutputFormat::Json;
    let pipeline = build_pipeline(&cli, json_output)?;

    match cli.command {
        Commands::Check => cmd_check(&pipeline, json_output).await?,
        Commands::Download => cmd_download(&pipeline, json_output).await?,
        Commands::Sync { install_mode } => {
            cmd_sync(&pipeline, install_mode.into(), json_output).await?
        }
        Commands::Status => cmd_status(&pipeline, json_output).await?,
        Commands::Clean { keep } => cmd_clean(&pipeline, keep, json_output).await?,
        Commands::Reset => cmd_reset(&pipeline, json_output).await?,
        Commands::DeviceId { reset } => cmd_device_id(&pipeline, reset, json_output).await?,
    }

    Ok(())
}

fn build_pipeline(cli: &Cli, json: bool) -> Result<UpdatePipeline> {
    let config_path = cli.get_config_path();
    let config = UpdaterConfig::load_file(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;
    let data_dir = config.resolved_data_dir()?;
    let store = Arc::new(FileStore::new(data_dir.join(STORE_FILE_NAME)));

    let hooks = if json {
        UpdateHooks::new()
    } else {
        UpdateHooks::new()
            .on_update_available(CliFormatter::offer)
            .on_update_downloaded(|bundle| {
                println!();
                CliFormatter::success(&format!("Bundle {} activated", bundle.version));
                CliFormatter::bundle(bundle);
            })
    };

    let context = UpdateContext::new(config, store)
        .with_hooks(hooks)
        .with_restarter(Arc::new(ExecRestarter));
    Ok(UpdatePipeline::new(context)?)
}

/// Draw download progress until aborted.
fn watch_progress(mut rx: watch::Receiver<InstallPhase>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let phase = rx.borrow_and_update().clone();
            match phase {
                InstallPhase::Downloading {
                    bytes_downloaded,
                    total_bytes,
                    ..
                } => CliFormatter::download_progress(bytes_downloaded, total_bytes),
                InstallPhase::Extracting => {
                    println!();
                    CliFormatter::info("Extracting archive");
                }
                _ => {}
            }
        }
    })
}

async fn cmd_check(pipeline: &UpdatePipeline, json: bool) -> Result<()> {
    let offer = pipeline.check_for_update().await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "appVersion": pipeline.current_app_version(),
                "hasUpdate": offer.is_some(),
                "offer": offer,
            })
        );
    } else if offer.is_none() {
        CliFormatter::success(&format!(
            "Up to date (app version {})",
            pipeline.current_app_version()
        ));
    }

    Ok(())
}

async fn cmd_download(pipeline: &UpdatePipeline, json: bool) -> Result<()> {
    let Some(offer) = pipeline.check_for_update().await? else {
        if json {
            println!("{}", serde_json::json!({ "installed": false }));
        } else {
            CliFormatter::success("Up to date, nothing to download");
        }
        return Ok(());
    };

    let progress = (!json).then(|| watch_progress(pipeline.subscribe_install()));
    let result = pipeline.download_update(&offer).await;
    if let Some(progress) = progress {
        progress.abort();
    }
    let bundle = result?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "installed": true, "bundle": bundle })
        );
    } else {
        if offer.is_mandatory {
            CliFormatter::warning("This update is mandatory; restart the app to load it");
        }
        CliFormatter::info("The new bundle loads on next restart");
    }

    Ok(())
}

async fn cmd_sync(pipeline: &UpdatePipeline, install_mode: InstallMode, json: bool) -> Result<()> {
    let options = SyncOptions {
        install_mode,
        ..Default::default()
    };

    let progress = (!json).then(|| watch_progress(pipeline.subscribe_install()));
    let result = pipeline.sync(options).await;
    if let Some(progress) = progress {
        progress.abort();
    }

    match result? {
        SyncOutcome::UpToDate => {
            if json {
                println!("{}", serde_json::json!({ "installed": false }));
            } else {
                CliFormatter::success("Up to date");
            }
        }
        // Immediate mode only gets here if the restart returned
        SyncOutcome::Installed {
            bundle,
            install_mode,
        } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "installed": true,
                        "installMode": install_mode,
                        "bundle": bundle,
                    })
                );
            } else {
                CliFormatter::info("The new bundle loads on next restart");
            }
        }
    }

    Ok(())
}

async fn cmd_status(pipeline: &UpdatePipeline, json: bool) -> Result<()> {
    let config = pipeline.config();
    let device = pipeline.device_id().await;
    let active = pipeline.active_bundle().await;
    let data_dir = config.resolved_data_dir()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "appVersion": config.app_version,
                "platform": config.platform,
                "deviceId": device.id,
                "deviceIdPersisted": device.persisted,
                "dataDir": data_dir,
                "state": pipeline.state(),
                "activeBundle": active,
            })
        );
        return Ok(());
    }

    CliFormatter::header("Bundlepush Status");
    CliFormatter::kv("App version", &config.app_version);
    CliFormatter::kv("Platform", config.platform.as_str());
    CliFormatter::kv("Device", &device.id);
    if !device.persisted {
        CliFormatter::warning("Device id could not be persisted and will change on restart");
    }
    CliFormatter::kv("Data dir", &data_dir.display().to_string());

    CliFormatter::header("Active Bundle");
    match active {
        Some(bundle) => {
            CliFormatter::bundle(&bundle);
            if let Ok(meta) = tokio::fs::metadata(&bundle.local_path).await {
                CliFormatter::kv("Size", &format_size(meta.len()));
            }
        }
        None => CliFormatter::kv("Bundle", &format!("shipped ({})", config.shipped_bundle_name)),
    }

    Ok(())
}

async fn cmd_clean(pipeline: &UpdatePipeline, keep: Option<String>, json: bool) -> Result<()> {
    let keep = match keep {
        Some(version) => version,
        None => pipeline
            .active_bundle()
            .await
            .map(|bundle| bundle.version)
            .ok_or_else(|| anyhow!("No active bundle; pass --keep <VERSION>"))?,
    };

    let removed = pipeline.clear_old_bundles(&keep).await;

    if json {
        println!(
            "{}",
            serde_json::json!({ "kept": keep, "removed": removed })
        );
    } else {
        CliFormatter::success(&format!("Removed {} old bundle artifacts, kept {}", removed, keep));
    }

    Ok(())
}

async fn cmd_reset(pipeline: &UpdatePipeline, json: bool) -> Result<()> {
    pipeline.clear_activation().await?;

    if json {
        println!("{}", serde_json::json!({ "reset": true }));
    } else {
        CliFormatter::success(&format!(
            "Reverted to the shipped bundle ({})",
            pipeline.config().shipped_bundle_name
        ));
    }

    Ok(())
}

async fn cmd_device_id(pipeline: &UpdatePipeline, reset: bool, json: bool) -> Result<()> {
    let device = if reset {
        pipeline.reset_device_id().await?
    } else {
        pipeline.device_id().await
    };

    if json {
        println!("{}", serde_json::to_string(&device)?);
    } else {
        if reset {
            CliFormatter::success("Generated a new device id");
        }
        println!("{}", device);
    }

    Ok(())
}
