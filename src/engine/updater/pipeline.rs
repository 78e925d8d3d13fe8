//! Update Pipeline
//!
//! Sequences check, install and activation for one host. All the state
//! the pipeline needs arrives through `UpdateContext` at construction.
//!
//! Overlapping `check_for_update`, `download_update` and `sync` calls are
//! rejected with `UpdateError::Busy`; the running call is unaffected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use super::bundle_dir::BundleDirectory;
use super::capabilities::Capabilities;
use super::checker::UpdateChecker;
use super::download::Downloader;
use super::installer::BundleInstaller;
use super::offer::{InstalledBundle, UpdateOffer};
use super::state::{InstallPhase, Phase, PhaseTracker, PipelineState};
use super::verify::TrustVerifier;
use crate::engine::config::{ConfigError, UpdaterConfig};
use crate::engine::error::UpdateError;
use crate::engine::identity::{DeviceIdentity, IdentityStore};
use crate::engine::storage::KeyValueStore;

#[derive(Error, Debug)]
pub enum RestartError {
    #[error("No restart handler is configured")]
    NotConfigured,
    #[error("Failed to restart: {0}")]
    Io(#[from] std::io::Error),
}

/// Restarts the host process. Called at most once per request, never
/// retried.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self) -> Result<(), RestartError>;
}

/// Replaces the current process with a fresh copy of the same binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecRestarter;

#[async_trait]
impl Restarter for ExecRestarter {
    async fn restart(&self) -> Result<(), RestartError> {
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        tracing::info!("Restarting {}", exe.display());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // exec only returns on failure
            let err = std::process::Command::new(&exe).args(&args).exec();
            Err(RestartError::Io(err))
        }

        #[cfg(not(unix))]
        {
            std::process::Command::new(&exe).args(&args).spawn()?;
            std::process::exit(0);
        }
    }
}

type Hook<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Host callbacks, invoked at the `UpdateAvailable`, `Installed` and
/// `Error` transitions only.
#[derive(Default)]
pub struct UpdateHooks {
    on_update_available: Option<Hook<UpdateOffer>>,
    on_update_downloaded: Option<Hook<InstalledBundle>>,
    on_error: Option<Hook<UpdateError>>,
}

impl UpdateHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update_available(mut self, f: impl Fn(&UpdateOffer) + Send + Sync + 'static) -> Self {
        self.on_update_available = Some(Box::new(f));
        self
    }

    pub fn on_update_downloaded(
        mut self,
        f: impl Fn(&InstalledBundle) + Send + Sync + 'static,
    ) -> Self {
        self.on_update_downloaded = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&UpdateError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckFrequency {
    /// Only when the host calls; there is no internal timer.
    #[default]
    OnDemand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMode {
    #[default]
    OnNextRestart,
    Immediate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub check_frequency: CheckFrequency,
    pub install_mode: InstallMode,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    UpToDate,
    Installed {
        bundle: InstalledBundle,
        /// Mode actually applied; mandatory offers force `Immediate`
        install_mode: InstallMode,
    },
}

/// Everything a pipeline is built from.
pub struct UpdateContext {
    pub config: UpdaterConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub capabilities: Capabilities,
    pub hooks: UpdateHooks,
    pub restarter: Option<Arc<dyn Restarter>>,
}

impl UpdateContext {
    pub fn new(config: UpdaterConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let capabilities = Capabilities::from_config(&config);
        Self {
            config,
            store,
            capabilities,
            hooks: UpdateHooks::default(),
            restarter: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_hooks(mut self, hooks: UpdateHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }
}

pub struct UpdatePipeline {
    config: UpdaterConfig,
    identity: IdentityStore,
    checker: UpdateChecker,
    installer: BundleInstaller,
    hooks: UpdateHooks,
    restarter: Option<Arc<dyn Restarter>>,
    state: PhaseTracker<PipelineState>,
    flight: Mutex<()>,
}

impl UpdatePipeline {
    pub fn new(context: UpdateContext) -> Result<Self, ConfigError> {
        let UpdateContext {
            config,
            store,
            capabilities,
            hooks,
            restarter,
        } = context;
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {}", e)))?;

        let identity = match &config.device_id {
            Some(id) => IdentityStore::with_override(store.clone(), id.clone()),
            None => IdentityStore::new(store.clone()),
        };
        let checker = UpdateChecker::new(
            client.clone(),
            config.check_url(),
            config.api_key.clone(),
            TrustVerifier::new(capabilities.signatures.clone()),
        );
        let installer = BundleInstaller::new(
            BundleDirectory::new(config.resolved_data_dir()?),
            Downloader::new(client),
            capabilities.extractor.clone(),
            store,
            config.bundle_file_name.clone(),
        );

        Ok(Self {
            config,
            identity,
            checker,
            installer,
            hooks,
            restarter,
            state: PhaseTracker::default(),
            flight: Mutex::new(()),
        })
    }

    /// Ask the server for an offer. `None` means no update is available.
    pub async fn check_for_update(&self) -> Result<Option<UpdateOffer>, UpdateError> {
        let _flight = self.flight.try_lock().map_err(|_| UpdateError::Busy)?;
        self.run_check().await.map_err(|e| self.fail(e))
    }

    /// Install a trusted offer and make it active for the next start.
    pub async fn download_update(&self, offer: &UpdateOffer) -> Result<InstalledBundle, UpdateError> {
        let _flight = self.flight.try_lock().map_err(|_| UpdateError::Busy)?;
        self.run_download(offer).await.map_err(|e| self.fail(e))
    }

    /// Check, then install any offer found. A mandatory offer always
    /// restarts, whatever `install_mode` asks for.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncOutcome, UpdateError> {
        let _flight = self.flight.try_lock().map_err(|_| UpdateError::Busy)?;
        tracing::debug!(
            "Sync requested ({:?}, {:?})",
            options.check_frequency,
            options.install_mode
        );

        let Some(offer) = self.run_check().await.map_err(|e| self.fail(e))? else {
            return Ok(SyncOutcome::UpToDate);
        };
        let bundle = self.run_download(&offer).await.map_err(|e| self.fail(e))?;

        let install_mode = if offer.is_mandatory {
            InstallMode::Immediate
        } else {
            options.install_mode
        };
        match install_mode {
            InstallMode::OnNextRestart => {
                tracing::info!("Bundle {} will be loaded on next restart", bundle.version);
            }
            InstallMode::Immediate => {
                if offer.is_mandatory {
                    tracing::info!("Offer {} is mandatory, restarting now", offer.version);
                }
                self.run_restart().await.map_err(|e| self.report(e))?;
            }
        }

        Ok(SyncOutcome::Installed {
            bundle,
            install_mode,
        })
    }

    /// Single attempt through the restart handler. A failure is reported
    /// to `on_error` and returned.
    pub async fn restart_app(&self) -> Result<(), UpdateError> {
        self.run_restart().await.map_err(|e| self.report(e))
    }

    async fn run_check(&self) -> Result<Option<UpdateOffer>, UpdateError> {
        self.settle();
        self.state.advance(PipelineState::Checking);

        // Identity goes into the request, so it is resolved first
        let identity = self.identity.get_or_create().await;
        let offer = self
            .checker
            .check(
                &identity,
                &self.config.app_version,
                self.config.platform,
                self.config.user_id.as_deref(),
            )
            .await?;

        if !offer.has_update {
            tracing::info!("No update available for {}", self.config.app_version);
            self.state.advance(PipelineState::NoUpdate);
            self.state.advance(PipelineState::Idle);
            return Ok(None);
        }

        tracing::info!("Update available: {}", offer.display_name());
        self.state.advance(PipelineState::UpdateAvailable {
            version: offer.version.clone(),
        });
        if let Some(hook) = &self.hooks.on_update_available {
            hook(&offer);
        }
        Ok(Some(offer))
    }

    async fn run_download(&self, offer: &UpdateOffer) -> Result<InstalledBundle, UpdateError> {
        if !offer.has_update {
            return Err(UpdateError::InvalidOffer(
                "offer does not carry an update".to_string(),
            ));
        }
        // Offers may come back from the host, so the policy runs again
        self.checker.enforce_trust(offer)?;

        if !matches!(self.state.current(), PipelineState::UpdateAvailable { .. }) {
            self.settle();
        }
        self.state.advance(PipelineState::Downloading {
            version: offer.version.clone(),
        });

        let bundle = self.installer.install(offer).await?;

        self.state.advance(PipelineState::Installed {
            version: bundle.version.clone(),
        });
        if let Some(hook) = &self.hooks.on_update_downloaded {
            hook(&bundle);
        }
        self.state.advance(PipelineState::Idle);
        Ok(bundle)
    }

    async fn run_restart(&self) -> Result<(), UpdateError> {
        let restarter = self.restarter.as_ref().ok_or(RestartError::NotConfigured)?;
        restarter.restart().await?;
        Ok(())
    }

    /// Return to `Idle` from a resting state left by an earlier call.
    fn settle(&self) {
        if !matches!(self.state.current(), PipelineState::Idle) {
            self.state.advance(PipelineState::Idle);
        }
    }

    /// Record a failed check or download and report it.
    fn fail(&self, error: UpdateError) -> UpdateError {
        tracing::error!("Update failed: {}", error);
        let failed = PipelineState::Error {
            message: error.to_string(),
        };
        if self.state.current().allows(&failed) {
            self.state.advance(failed);
        } else {
            // Rejected before the pipeline left a resting state
            self.state.reset(failed);
        }
        self.state.advance(PipelineState::Idle);
        self.report(error)
    }

    fn report(&self, error: UpdateError) -> UpdateError {
        if let Some(hook) = &self.hooks.on_error {
            hook(&error);
        }
        error
    }

    pub fn current_app_version(&self) -> &str {
        &self.config.app_version
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub async fn device_id(&self) -> DeviceIdentity {
        self.identity.get_or_create().await
    }

    /// Future checks use the new id; calls already running keep the old.
    pub async fn reset_device_id(&self) -> Result<DeviceIdentity, UpdateError> {
        Ok(self.identity.reset().await?)
    }

    pub async fn active_bundle(&self) -> Option<InstalledBundle> {
        self.installer.active_bundle().await
    }

    pub async fn downloaded_bundle_path(&self) -> Option<PathBuf> {
        self.installer.downloaded_bundle_path().await
    }

    pub async fn clear_old_bundles(&self, keep_version: &str) -> usize {
        self.installer.clear_old_bundles(keep_version).await
    }

    pub async fn local_bundle_path(&self, version: &str) -> Option<PathBuf> {
        self.installer.local_bundle_path(version).await
    }

    pub async fn clear_activation(&self) -> Result<(), UpdateError> {
        self.installer.clear_activation().await?;
        Ok(())
    }

    pub fn installer(&self) -> &BundleInstaller {
        &self.installer
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn subscribe_install(&self) -> watch::Receiver<InstallPhase> {
        self.installer.subscribe()
    }
}
