//! Update offers and installed bundles

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }

    /// Platform of the build target; only iOS targets report `ios`,
    /// everything else falls back to android. Hosts on other targets set
    /// `platform` in their config.
    pub fn current() -> Self {
        if cfg!(target_os = "ios") {
            Self::Ios
        } else {
            Self::Android
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server response to a check request.
///
/// Missing and `null` fields both read as empty. `platform` is kept as
/// the server sent it since it is part of the signed payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOffer {
    #[serde(default, deserialize_with = "null_as_default")]
    pub has_update: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_mandatory: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    /// Base64 DER public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Base64 signature over the signing payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// How the bundle of an offer is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<'a> {
    Archive { zip_url: &'a str },
    Separate {
        bundle_url: &'a str,
        assets_url: Option<&'a str>,
    },
}

impl UpdateOffer {
    /// Exactly one of `zipUrl` / `bundleUrl` must be present.
    pub fn delivery(&self) -> Option<Delivery<'_>> {
        let zip_url = non_empty(&self.zip_url);
        let bundle_url = non_empty(&self.bundle_url);
        match (zip_url, bundle_url) {
            (Some(zip_url), None) => Some(Delivery::Archive { zip_url }),
            (None, Some(bundle_url)) => Some(Delivery::Separate {
                bundle_url,
                assets_url: non_empty(&self.assets_url),
            }),
            _ => None,
        }
    }

    pub fn has_public_key(&self) -> bool {
        non_empty(&self.public_key).is_some()
    }

    pub fn has_signature(&self) -> bool {
        non_empty(&self.signature).is_some()
    }

    /// Label if set, version otherwise.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.version
        } else {
            &self.label
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// The bundle the host loads on its next start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledBundle {
    pub version: String,
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_path: Option<PathBuf>,
    pub installed_at: DateTime<Utc>,
    /// Hex SHA-256 of the bundle file
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
}
