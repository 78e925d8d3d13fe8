//! Updater Configuration Module
//! Handles loading and validating bundlepush.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::updater::offer::Platform;

pub const CONFIG_FILE_NAME: &str = "bundlepush.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    #[default]
    Zip,
    TarGz,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterConfig {
    pub api_key: String,
    pub api_url: String,
    pub app_version: String,
    #[serde(default = "Platform::current")]
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Host override; when set no identity is ever generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_bundle_file_name")]
    pub bundle_file_name: String,
    #[serde(default = "default_shipped_bundle_name")]
    pub shipped_bundle_name: String,
    #[serde(default)]
    pub extractor: ExtractorKind,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_bundle_file_name() -> String {
    "bundle.js".to_string()
}

fn default_shipped_bundle_name() -> String {
    "index.bundle".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl UpdaterConfig {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            app_version: app_version.into(),
            platform: Platform::current(),
            user_id: None,
            device_id: None,
            data_dir: None,
            bundle_file_name: default_bundle_file_name(),
            shipped_bundle_name: default_shipped_bundle_name(),
            extractor: ExtractorKind::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        Self::load_file(&dir.join(CONFIG_FILE_NAME))
    }

    pub fn load_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }
        let content = std::fs::read_to_string(config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = config_path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_version.trim().is_empty() {
            return Err(ConfigError::Invalid("appVersion is required".to_string()));
        }
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("apiUrl is required".to_string()));
        }
        if reqwest::Url::parse(&self.api_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "apiUrl is not a valid URL: {}",
                self.api_url
            )));
        }
        if self.bundle_file_name.is_empty() || self.bundle_file_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "bundleFileName must be a plain file name: {:?}",
                self.bundle_file_name
            )));
        }
        Ok(())
    }

    /// Configured data dir, or `<platform data dir>/bundlepush`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|d| d.join("bundlepush"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine data directory".to_string()))
    }

    pub fn check_url(&self) -> String {
        format!("{}/api/updates/check", self.api_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
