//! Update Check Protocol
//!
//! One POST to `/api/updates/check`, then the trust policy on the
//! response. Retries are the orchestrator's business.

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use thiserror::Error;

use super::offer::{Platform, UpdateOffer};
use super::verify::TrustVerifier;
use crate::engine::identity::DeviceIdentity;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Update check request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Update check failed: HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Update check returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("Update is not signed. This app requires signed updates")]
    SignatureRequired,
    #[error("Update signature verification failed. Update may be compromised")]
    SignatureInvalid,
    #[error("Invalid update offer: {0}")]
    InvalidOffer(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest<'a> {
    app_version: &'a str,
    platform: Platform,
    device_id: &'a str,
    user_id: Option<&'a str>,
}

pub struct UpdateChecker {
    client: reqwest::Client,
    check_url: String,
    api_key: String,
    verifier: TrustVerifier,
}

impl UpdateChecker {
    pub fn new(
        client: reqwest::Client,
        check_url: impl Into<String>,
        api_key: impl Into<String>,
        verifier: TrustVerifier,
    ) -> Self {
        Self {
            client,
            check_url: check_url.into(),
            api_key: api_key.into(),
            verifier,
        }
    }

    pub async fn check(
        &self,
        identity: &DeviceIdentity,
        app_version: &str,
        platform: Platform,
        user_id: Option<&str>,
    ) -> Result<UpdateOffer, CheckError> {
        let request = CheckRequest {
            app_version,
            platform,
            device_id: identity.as_str(),
            user_id,
        };
        tracing::debug!(
            "Checking for updates at {} (app {}, {}, device {})",
            self.check_url,
            app_version,
            platform,
            identity
        );

        let response = self
            .client
            .post(&self.check_url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, concat!("bundlepush/", env!("CARGO_PKG_VERSION")))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let offer: UpdateOffer = serde_json::from_slice(&body)
            .map_err(|e| CheckError::InvalidResponse(e.to_string()))?;

        self.enforce_trust(&offer)?;
        Ok(offer)
    }

    /// An offer with an update is accepted only unsigned-without-key, or
    /// with a key and a signature that verifies. Never downgraded to
    /// "no update".
    pub fn enforce_trust(&self, offer: &UpdateOffer) -> Result<(), CheckError> {
        if !offer.has_update {
            return Ok(());
        }

        match (offer.public_key.as_deref(), offer.signature.as_deref()) {
            (Some(key), Some(signature)) if offer.has_public_key() && offer.has_signature() => {
                if !self.verifier.verify(key, offer, signature) {
                    tracing::error!("Signature verification failed for offer {}", offer.version);
                    return Err(CheckError::SignatureInvalid);
                }
                tracing::info!("Signature verified for offer {}", offer.version);
            }
            _ if offer.has_public_key() => {
                tracing::warn!("Offer {} carries a public key but no signature", offer.version);
                return Err(CheckError::SignatureRequired);
            }
            _ => {
                tracing::debug!("Offer {} is unsigned and carries no key", offer.version);
            }
        }

        if offer.delivery().is_none() {
            return Err(CheckError::InvalidOffer(
                "exactly one of zipUrl or bundleUrl must be provided".to_string(),
            ));
        }
        Ok(())
    }
}
