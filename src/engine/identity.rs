//! Device identity
//!
//! A stable identifier sent with every check request. Generated once per
//! install and persisted in the host's key-value store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::storage::{KeyValueStore, StorageError};

pub const DEVICE_ID_KEY: &str = "deviceId";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Device identity storage unavailable: {0}")]
    Unavailable(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    /// False when persistence failed and the id only lives as long as
    /// this process.
    pub persisted: bool,
}

impl DeviceIdentity {
    fn generate() -> String {
        format!("device_{}", Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    override_id: Option<String>,
    current: Mutex<Option<DeviceIdentity>>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            override_id: None,
            current: Mutex::new(None),
        }
    }

    /// Use a host-provided id instead of generating one.
    pub fn with_override(store: Arc<dyn KeyValueStore>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            override_id: Some(device_id.into()),
            current: Mutex::new(None),
        }
    }

    /// Return the persisted identity, creating it on first use.
    ///
    /// The lock is held across read, generate and write, so concurrent
    /// first-time callers all observe the value written by the first.
    pub async fn get_or_create(&self) -> DeviceIdentity {
        let mut current = self.current.lock().await;
        if let Some(identity) = current.as_ref() {
            return identity.clone();
        }

        if let Some(id) = &self.override_id {
            let identity = DeviceIdentity {
                id: id.clone(),
                persisted: true,
            };
            *current = Some(identity.clone());
            return identity;
        }

        let identity = match self.load_or_generate().await {
            Ok(identity) => identity,
            Err(e) => {
                let identity = DeviceIdentity {
                    id: DeviceIdentity::generate(),
                    persisted: false,
                };
                tracing::warn!(
                    "Device identity unavailable ({}), using volatile id {}",
                    e,
                    identity
                );
                identity
            }
        };

        *current = Some(identity.clone());
        identity
    }

    async fn load_or_generate(&self) -> Result<DeviceIdentity, IdentityError> {
        if let Some(id) = self.store.get(DEVICE_ID_KEY).await? {
            if !id.trim().is_empty() {
                tracing::debug!("Loaded existing device id {}", id);
                return Ok(DeviceIdentity { id, persisted: true });
            }
        }

        let id = DeviceIdentity::generate();
        self.store.set(DEVICE_ID_KEY, &id).await?;
        tracing::info!("Generated new device id {}", id);
        Ok(DeviceIdentity { id, persisted: true })
    }

    /// Replace the identity. Callers already holding the old value keep
    /// using it; only later checks see the new one.
    pub async fn reset(&self) -> Result<DeviceIdentity, IdentityError> {
        let mut current = self.current.lock().await;
        let id = DeviceIdentity::generate();
        self.store.set(DEVICE_ID_KEY, &id).await?;
        tracing::info!("Device id reset to {}", id);

        let identity = DeviceIdentity { id, persisted: true };
        *current = Some(identity.clone());
        Ok(identity)
    }

    /// The identity resolved so far, without touching storage.
    pub async fn peek(&self) -> Option<DeviceIdentity> {
        self.current.lock().await.clone()
    }
}
