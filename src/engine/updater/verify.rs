//! Offer Signature Verification
//!
//! Builds the canonical signing payload of an offer and checks an RSA
//! PKCS#1 v1.5 / SHA-256 signature over the payload's SHA-256 digest.
//! The signed message is the 32-byte digest, so the scheme hashes it
//! once more. Pure functions over the bytes handed in: no network, no
//! disk.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::offer::UpdateOffer;

/// Signature scheme used to check offers.
pub trait SignatureBackend: Send + Sync {
    /// `public_key` and `signature` are raw (already base64-decoded)
    /// bytes. Must not panic on malformed input.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;

    fn name(&self) -> &'static str;
}

/// RSA PKCS#1 v1.5 with SHA-256, public key as DER `RSAPublicKey`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RingRsaBackend;

impl SignatureBackend for RingRsaBackend {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, public_key)
            .verify(message, signature)
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "rsa-pkcs1-sha256"
    }
}

pub struct TrustVerifier {
    backend: Arc<dyn SignatureBackend>,
}

impl TrustVerifier {
    pub fn new(backend: Arc<dyn SignatureBackend>) -> Self {
        Self { backend }
    }

    /// Deterministic `key:value` pairs joined with `|`, absent fields as
    /// empty strings. Must match the server byte for byte.
    pub fn build_payload(offer: &UpdateOffer) -> Vec<u8> {
        let platform = offer.platform.as_deref().unwrap_or("");
        let parts = [
            format!("version:{}", offer.version),
            format!("label:{}", offer.label),
            format!("platform:{}", platform),
            format!("bundleUrl:{}", offer.bundle_url.as_deref().unwrap_or("")),
            format!("assetsUrl:{}", offer.assets_url.as_deref().unwrap_or("")),
            format!("zipUrl:{}", offer.zip_url.as_deref().unwrap_or("")),
            format!("isMandatory:{}", offer.is_mandatory),
            format!("description:{}", offer.description),
        ];
        parts.join("|").into_bytes()
    }

    /// SHA-256 of the signing payload. This is the message the server
    /// signs.
    pub fn signed_message(offer: &UpdateOffer) -> Vec<u8> {
        Sha256::digest(Self::build_payload(offer)).to_vec()
    }

    /// Hex SHA-256 of the signing payload, for diagnostics.
    pub fn payload_digest(offer: &UpdateOffer) -> String {
        hex::encode(Self::signed_message(offer))
    }

    /// Check `signature` (base64) over the offer's payload with
    /// `public_key` (base64 DER). Any decoding problem is a `false`.
    pub fn verify(&self, public_key: &str, offer: &UpdateOffer, signature: &str) -> bool {
        let Ok(key_bytes) = STANDARD.decode(public_key.trim()) else {
            tracing::warn!("Offer public key is not valid base64");
            return false;
        };
        let Ok(signature_bytes) = STANDARD.decode(signature.trim()) else {
            tracing::warn!("Offer signature is not valid base64");
            return false;
        };

        let message = Self::signed_message(offer);
        let valid = self.backend.verify(&key_bytes, &message, &signature_bytes);
        tracing::debug!(
            "Signature check ({}) for payload {}: {}",
            self.backend.name(),
            Self::payload_digest(offer),
            if valid { "valid" } else { "invalid" }
        );
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};

    const PRIVATE_KEY: &[u8] = include_bytes!("../../../tests/fixtures/signing_key.pk8");
    const PUBLIC_KEY: &[u8] = include_bytes!("../../../tests/fixtures/signing_key.pub.der");

    fn sample_offer() -> UpdateOffer {
        UpdateOffer {
            has_update: true,
            version: "2.0.0".to_string(),
            label: "v2".to_string(),
            platform: Some("android".to_string()),
            zip_url: Some("https://x/u.zip".to_string()),
            description: "Bug fixes".to_string(),
            ..Default::default()
        }
    }

    fn sign(offer: &UpdateOffer) -> Vec<u8> {
        let key_pair = RsaKeyPair::from_pkcs8(PRIVATE_KEY).unwrap();
        let mut signature = vec![0u8; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                &TrustVerifier::signed_message(offer),
                &mut signature,
            )
            .unwrap();
        signature
    }

    fn verifier() -> TrustVerifier {
        TrustVerifier::new(Arc::new(RingRsaBackend))
    }

    #[test]
    fn test_payload_format() {
        let payload = TrustVerifier::build_payload(&sample_offer());
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "version:2.0.0|label:v2|platform:android|bundleUrl:|assetsUrl:|zipUrl:https://x/u.zip|isMandatory:false|description:Bug fixes"
        );
    }

    #[test]
    fn test_payload_empty_offer() {
        let payload = TrustVerifier::build_payload(&UpdateOffer::default());
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "version:|label:|platform:|bundleUrl:|assetsUrl:|zipUrl:|isMandatory:false|description:"
        );
    }

    #[test]
    fn test_payload_is_deterministic() {
        let offer = sample_offer();
        let mut same = offer.clone();
        // Fields outside the payload do not change it
        same.public_key = Some("a2V5".to_string());
        same.signature = Some("c2ln".to_string());
        same.update_id = Some("upd_9".to_string());

        assert_eq!(
            TrustVerifier::build_payload(&offer),
            TrustVerifier::build_payload(&same)
        );
        assert_eq!(
            TrustVerifier::payload_digest(&offer),
            TrustVerifier::payload_digest(&same)
        );
    }

    #[test]
    fn test_valid_signature() {
        let offer = sample_offer();
        let signature = STANDARD.encode(sign(&offer));
        let public_key = STANDARD.encode(PUBLIC_KEY);

        assert!(verifier().verify(&public_key, &offer, &signature));
    }

    #[test]
    fn test_signature_covers_payload_digest() {
        let offer = sample_offer();
        let public_key = STANDARD.encode(PUBLIC_KEY);
        assert_eq!(
            TrustVerifier::signed_message(&offer),
            Sha256::digest(TrustVerifier::build_payload(&offer)).to_vec()
        );

        // A signature over the bare payload is not the server's scheme
        let key_pair = RsaKeyPair::from_pkcs8(PRIVATE_KEY).unwrap();
        let mut signature = vec![0u8; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                &TrustVerifier::build_payload(&offer),
                &mut signature,
            )
            .unwrap();
        assert!(!verifier().verify(&public_key, &offer, &STANDARD.encode(&signature)));
    }

    #[test]
    fn test_unknown_platform_is_signed_verbatim() {
        let mut offer = sample_offer();
        offer.platform = Some("IOS".to_string());
        let payload = String::from_utf8(TrustVerifier::build_payload(&offer)).unwrap();
        assert!(payload.contains("|platform:IOS|"));

        let signature = STANDARD.encode(sign(&offer));
        let public_key = STANDARD.encode(PUBLIC_KEY);
        assert!(verifier().verify(&public_key, &offer, &signature));

        offer.platform = Some("ios".to_string());
        assert!(!verifier().verify(&public_key, &offer, &signature));
    }

    #[test]
    fn test_fixture_public_key_matches_private_key() {
        let key_pair = RsaKeyPair::from_pkcs8(PRIVATE_KEY).unwrap();
        assert_eq!(key_pair.public().as_ref(), PUBLIC_KEY);
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let offer = sample_offer();
        let signature = sign(&offer);
        let public_key = STANDARD.encode(PUBLIC_KEY);

        for index in [0, signature.len() / 2, signature.len() - 1] {
            let mut tampered = signature.clone();
            tampered[index] ^= 0x01;
            assert!(!verifier().verify(&public_key, &offer, &STANDARD.encode(&tampered)));
        }
    }

    #[test]
    fn test_tampered_offer_fails() {
        let offer = sample_offer();
        let signature = STANDARD.encode(sign(&offer));
        let public_key = STANDARD.encode(PUBLIC_KEY);

        let mut tampered = offer.clone();
        tampered.zip_url = Some("https://evil/u.zip".to_string());
        assert!(!verifier().verify(&public_key, &tampered, &signature));

        let mut tampered = offer;
        tampered.is_mandatory = true;
        assert!(!verifier().verify(&public_key, &tampered, &signature));
    }

    #[test]
    fn test_malformed_inputs_return_false() {
        let offer = sample_offer();
        let signature = STANDARD.encode(sign(&offer));
        let public_key = STANDARD.encode(PUBLIC_KEY);

        assert!(!verifier().verify("not base64!!", &offer, &signature));
        assert!(!verifier().verify(&public_key, &offer, "%%%"));
        assert!(!verifier().verify(&STANDARD.encode(b"short key"), &offer, &signature));
        assert!(!verifier().verify(&public_key, &offer, ""));
    }
}
