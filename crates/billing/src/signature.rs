//! Webhook signature verification
//!
//! Standard Webhooks signing: the signed content is
//! `{webhook-id}.{webhook-timestamp}.{raw body}`, HMAC-SHA256 keyed by the
//! webhook secret, base64 encoded and optionally prefixed with a version tag
//! (`v1,<signature>`).
//!
//! Verification must run against the raw bytes received, before any JSON
//! parsing, since a re-serialized body will not hash the same.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook delivery.
///
/// `signature_header` may be `v1,<base64>` or bare base64. When a comma is
/// present only the part after the first comma is used.
pub fn verify(
    secret: &str,
    webhook_id: &str,
    timestamp: &str,
    raw_body: &[u8],
    signature_header: &str,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    if webhook_id.is_empty() {
        return Err(SignatureError::MissingHeader("webhook-id"));
    }
    if timestamp.is_empty() {
        return Err(SignatureError::MissingHeader("webhook-timestamp"));
    }
    if signature_header.is_empty() {
        return Err(SignatureError::MissingHeader("webhook-signature"));
    }

    let encoded = match signature_header.split_once(',') {
        Some((_version, signature)) => signature,
        None => signature_header,
    };

    let provided = STANDARD
        .decode(encoded)
        .map_err(|_| SignatureError::MalformedSignature)?;

    let expected = compute_mac(secret, webhook_id, timestamp, raw_body);

    // ct_eq on slices of different length returns false without inspecting contents
    if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        Ok(())
    } else {
        Err(SignatureError::SignatureMismatch)
    }
}

/// Compute the base64 signature for a delivery, as the provider would send it.
pub fn sign(secret: &str, webhook_id: &str, timestamp: &str, raw_body: &[u8]) -> String {
    STANDARD.encode(compute_mac(secret, webhook_id, timestamp, raw_body))
}

fn compute_mac(secret: &str, webhook_id: &str, timestamp: &str, raw_body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(webhook_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    mac.finalize().into_bytes().to_vec()
}

/// Signature verifier bound to a secret, with optional replay protection
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: Option<i64>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret_len", &self.secret.len())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: None,
        }
    }

    /// Reject deliveries whose timestamp is further than `secs` from now.
    /// Zero disables the check.
    pub fn with_tolerance(mut self, secs: u64) -> Self {
        self.tolerance_secs = if secs == 0 {
            None
        } else {
            Some(i64::try_from(secs).unwrap_or(i64::MAX))
        };
        self
    }

    pub fn verify(
        &self,
        webhook_id: &str,
        timestamp: &str,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<(), SignatureError> {
        self.verify_at(
            webhook_id,
            timestamp,
            raw_body,
            signature_header,
            OffsetDateTime::now_utc(),
        )
    }

    pub fn verify_at(
        &self,
        webhook_id: &str,
        timestamp: &str,
        raw_body: &[u8],
        signature_header: &str,
        now: OffsetDateTime,
    ) -> Result<(), SignatureError> {
        verify(&self.secret, webhook_id, timestamp, raw_body, signature_header)?;

        if let Some(tolerance) = self.tolerance_secs {
            let sent_at: i64 = timestamp
                .trim()
                .parse()
                .map_err(|_| SignatureError::StaleTimestamp)?;
            let skew = (now.unix_timestamp() - sent_at).abs();
            if skew > tolerance {
                tracing::warn!(
                    webhook_id = %webhook_id,
                    skew_secs = skew,
                    tolerance_secs = tolerance,
                    "Webhook timestamp outside tolerance"
                );
                return Err(SignatureError::StaleTimestamp);
            }
        }

        Ok(())
    }
}
