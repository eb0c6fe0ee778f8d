//! Billing error types

use thiserror::Error;

/// Result alias used across the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Webhook signature verification failures.
///
/// These are terminal for the request that carried them: the HTTP layer
/// answers with a 4xx and the provider decides whether to redeliver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    MissingSecret,

    #[error("webhook header is missing: {0}")]
    MissingHeader(&'static str),

    #[error("webhook signature is not valid base64")]
    MalformedSignature,

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("webhook timestamp is outside the accepted window")]
    StaleTimestamp,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("quota not found")]
    QuotaNotFound,

    #[error("checkout session not found: {0}")]
    CheckoutNotFound(String),

    #[error("no organization linked to external customer {0}")]
    OrganizationNotFound(String),

    /// Transport failure (`status == None`) or a non-success provider response.
    #[error("provider unavailable ({}): {body}", describe_status(.status))]
    ProviderUnavailable { status: Option<u16>, body: String },

    #[error("invoice quota exhausted")]
    QuotaExhausted,

    #[error("checkout verification timed out after {elapsed_secs} seconds (last status: {last_status})")]
    CheckoutVerificationTimeout {
        last_status: String,
        elapsed_secs: u64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "transport error".to_string(),
    }
}

impl BillingError {
    pub fn provider_status(status: u16, body: impl Into<String>) -> Self {
        BillingError::ProviderUnavailable {
            status: Some(status),
            body: body.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        BillingError::ProviderUnavailable {
            status: None,
            body: message.into(),
        }
    }

    /// Whether a provider call that failed with this error may be attempted again.
    ///
    /// Not-found and explicit 400/401/403 answers are final. Everything else
    /// (network failures, 5xx, 429, ambiguous timeouts) is worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::SubscriptionNotFound
            | BillingError::QuotaNotFound
            | BillingError::CheckoutNotFound(_)
            | BillingError::OrganizationNotFound(_) => false,
            BillingError::ProviderUnavailable {
                status: Some(400 | 401 | 403 | 404),
                ..
            } => false,
            BillingError::ProviderUnavailable { .. } => true,
            BillingError::Signature(_)
            | BillingError::QuotaExhausted
            | BillingError::Cancelled
            | BillingError::InvalidPayload(_)
            | BillingError::InvalidSubscription(_)
            | BillingError::Config(_) => false,
            BillingError::CheckoutVerificationTimeout { .. } | BillingError::Database(_) => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BillingError::SubscriptionNotFound
                | BillingError::QuotaNotFound
                | BillingError::CheckoutNotFound(_)
                | BillingError::OrganizationNotFound(_)
        )
    }

    /// Status code the HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            BillingError::Signature(SignatureError::MissingSecret) => 503,
            BillingError::Signature(_) => 401,
            e if e.is_not_found() => 404,
            BillingError::InvalidPayload(_) | BillingError::InvalidSubscription(_) => 400,
            BillingError::QuotaExhausted => 402,
            BillingError::CheckoutVerificationTimeout { .. } => 504,
            BillingError::Cancelled => 499,
            BillingError::ProviderUnavailable { .. } => 502,
            _ => 500,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => BillingError::provider_status(status.as_u16(), err.to_string()),
            None => BillingError::transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_final() {
        for status in [400, 401, 403, 404] {
            let err = BillingError::provider_status(status, "nope");
            assert!(!err.is_retryable(), "{} should not be retried", status);
        }
        assert!(!BillingError::CheckoutNotFound("chk_1".into()).is_retryable());
        assert!(!BillingError::SubscriptionNotFound.is_retryable());
    }

    #[test]
    fn test_server_and_transport_errors_are_retryable() {
        for status in [429, 500, 502, 503, 504] {
            let err = BillingError::provider_status(status, "busy");
            assert!(err.is_retryable(), "{} should be retried", status);
        }
        assert!(BillingError::transport("connection reset").is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            BillingError::from(SignatureError::SignatureMismatch).http_status(),
            401
        );
        assert_eq!(BillingError::QuotaNotFound.http_status(), 404);
        assert_eq!(BillingError::QuotaExhausted.http_status(), 402);
        assert_eq!(
            BillingError::CheckoutVerificationTimeout {
                last_status: "open".into(),
                elapsed_secs: 10
            }
            .http_status(),
            504
        );
    }

    #[test]
    fn test_timeout_message_carries_last_status() {
        let err = BillingError::CheckoutVerificationTimeout {
            last_status: "confirmed".into(),
            elapsed_secs: 10,
        };
        assert!(err.to_string().contains("last status: confirmed"));
    }
}
