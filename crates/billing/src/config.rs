//! Billing configuration loaded from the environment

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_API_URL: &str = "https://api.polar.sh";
pub const DEFAULT_METER_SLUG: &str = "invoice_processing";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Timing of the checkout confirmation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutPolling {
    /// Total time allowed for confirmation, independent of the caller's deadline
    pub budget: Duration,
    /// Fixed wait between attempts; the first attempt is immediate
    pub interval: Duration,
}

impl Default for CheckoutPolling {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(10),
            interval: Duration::from_secs(2),
        }
    }
}

/// Provider and webhook settings
#[derive(Clone)]
pub struct BillingConfig {
    pub api_url: String,
    pub access_token: String,
    pub webhook_secret: String,
    pub meter_slug: String,
    pub request_timeout: Duration,
    /// Zero disables the webhook timestamp window
    pub webhook_tolerance_secs: u64,
    pub polling: CheckoutPolling,
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("api_url", &self.api_url)
            .field("access_token", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("meter_slug", &self.meter_slug)
            .field("request_timeout", &self.request_timeout)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("polling", &self.polling)
            .finish()
    }
}

impl BillingConfig {
    pub fn new(access_token: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            access_token: access_token.into(),
            webhook_secret: webhook_secret.into(),
            meter_slug: DEFAULT_METER_SLUG.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            polling: CheckoutPolling::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// Required: `POLAR_ACCESS_TOKEN`, `POLAR_WEBHOOK_SECRET`.
    /// Optional: `POLAR_API_URL`, `POLAR_METER_SLUG`, `POLAR_REQUEST_TIMEOUT_SECS`,
    /// `POLAR_WEBHOOK_TOLERANCE_SECS`.
    pub fn from_env() -> BillingResult<Self> {
        let access_token = required("POLAR_ACCESS_TOKEN")?;
        let webhook_secret = required("POLAR_WEBHOOK_SECRET")?;

        let mut config = Self::new(access_token, webhook_secret);

        if let Some(url) = optional("POLAR_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(slug) = optional("POLAR_METER_SLUG") {
            config.meter_slug = slug;
        }
        if let Some(secs) = optional_u64("POLAR_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_u64("POLAR_WEBHOOK_TOLERANCE_SECS")? {
            config.webhook_tolerance_secs = secs;
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_polling(mut self, polling: CheckoutPolling) -> Self {
        self.polling = polling;
        self
    }
}

fn required(key: &str) -> BillingResult<String> {
    optional(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn optional_u64(key: &str) -> BillingResult<Option<u64>> {
    optional(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| BillingError::Config(format!("{} is not a number: {}", key, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "POLAR_ACCESS_TOKEN",
            "POLAR_WEBHOOK_SECRET",
            "POLAR_API_URL",
            "POLAR_METER_SLUG",
            "POLAR_REQUEST_TIMEOUT_SECS",
            "POLAR_WEBHOOK_TOLERANCE_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_token_and_secret() {
        clear_env();
        assert!(matches!(
            BillingConfig::from_env(),
            Err(BillingError::Config(_))
        ));

        std::env::set_var("POLAR_ACCESS_TOKEN", "polar_oat_123");
        assert!(matches!(
            BillingConfig::from_env(),
            Err(BillingError::Config(msg)) if msg.contains("POLAR_WEBHOOK_SECRET")
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_and_overrides() {
        clear_env();
        std::env::set_var("POLAR_ACCESS_TOKEN", "polar_oat_123");
        std::env::set_var("POLAR_WEBHOOK_SECRET", "whsec_abc");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.meter_slug, DEFAULT_METER_SLUG);
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.polling, CheckoutPolling::default());

        std::env::set_var("POLAR_API_URL", "https://sandbox-api.polar.sh/");
        std::env::set_var("POLAR_WEBHOOK_TOLERANCE_SECS", "0");
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.api_url, "https://sandbox-api.polar.sh");
        assert_eq!(config.webhook_tolerance_secs, 0);

        std::env::set_var("POLAR_REQUEST_TIMEOUT_SECS", "soon");
        assert!(BillingConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = BillingConfig::new("polar_oat_secret", "whsec_secret");
        let printed = format!("{:?}", config);
        assert!(!printed.contains("polar_oat_secret"));
        assert!(!printed.contains("whsec_secret"));
    }
}
