//! Bundlepush CLI Module
//! Command-line interface for driving the update pipeline

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::CONFIG_FILE_NAME;
use crate::engine::updater::InstallMode;

pub mod formatter;

#[derive(Parser, Debug)]
#[command(name = "bundlepush")]
#[command(version)]
#[command(about = "Check, download and activate signed app bundles", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./bundlepush.config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum InstallModeArg {
    /// Activate now, load on the next start
    OnNextRestart,
    /// Activate and restart right away
    Immediate,
}

impl From<InstallModeArg> for InstallMode {
    fn from(arg: InstallModeArg) -> Self {
        match arg {
            InstallModeArg::OnNextRestart => InstallMode::OnNextRestart,
            InstallModeArg::Immediate => InstallMode::Immediate,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask the update server for a newer bundle
    Check,

    /// Check, then download and activate any offer without restarting
    Download,

    /// Check and install, restarting when required
    Sync {
        /// When the new bundle takes effect (mandatory offers always restart)
        #[arg(short, long, default_value = "on-next-restart")]
        install_mode: InstallModeArg,
    },

    /// Show the active bundle and device identity
    Status,

    /// Remove stored bundles other than the given version
    Clean {
        /// Version to keep (defaults to the active one)
        #[arg(short, long)]
        keep: Option<String>,
    },

    /// Revert to the bundle shipped with the app
    Reset,

    /// Show or regenerate the device identifier
    DeviceId {
        /// Generate a new identifier
        #[arg(long)]
        reset: bool,
    },
}

impl Cli {
    pub fn get_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(CONFIG_FILE_NAME)
        })
    }
}
