//! Provider adapter
//!
//! Translates provider JSON into domain entities, owns the bounded checkout
//! confirmation loop and reports usage meter events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::client::ProviderClient;
use crate::config::CheckoutPolling;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    is_canceled_status, BillingPeriod, CheckoutSessionResponse, Subscription,
    METADATA_INVOICE_COUNT_MAX, METADATA_MAX_SEATS,
};

/// Product metadata key carrying the quota ceiling (string-typed number)
pub const PRODUCT_INVOICE_COUNT_KEY: &str = "invoice_count";
/// Product metadata key carrying the seat limit
pub const PRODUCT_MAX_SEATS_KEY: &str = "max_seats";

const SUBSCRIPTIONS_PATH: &str = "/v1/subscriptions";
const CHECKOUTS_PATH: &str = "/v1/checkouts/custom";
const EVENTS_INGEST_PATH: &str = "/v1/events/ingest";

/// Operations the billing service needs from the provider
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Current subscription for an external customer. `organization_id` on the
    /// returned record is nil; the caller sets it.
    async fn fetch_subscription(&self, external_customer_id: &str) -> BillingResult<Subscription>;

    /// Single attempt to read a checkout session
    async fn resolve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionResponse>;

    /// Poll a checkout session until it succeeds, fails terminally, times out
    /// or `cancel` fires
    async fn confirm_checkout_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> BillingResult<CheckoutSessionResponse>;

    async fn ingest_usage_event(
        &self,
        external_customer_id: &str,
        meter_name: &str,
        amount: i64,
    ) -> BillingResult<()>;
}

// =============================================================================
// Provider payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    items: Vec<ProviderSubscription>,
}

#[derive(Debug, Deserialize)]
struct ProviderSubscription {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    current_period_start: Option<String>,
    #[serde(default)]
    current_period_end: Option<String>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    canceled_at: Option<String>,
    #[serde(default)]
    customer: ProviderCustomer,
    #[serde(default)]
    product: ProviderProduct,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderCustomer {
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderProduct {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct IdOnly {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderCheckout {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    customer_external_id: Option<String>,
    #[serde(default)]
    customer: Option<ProviderCustomer>,
    #[serde(default)]
    product: Option<IdOnly>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    subscription: Option<IdOnly>,
    #[serde(default)]
    subscription_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

// =============================================================================
// Adapter
// =============================================================================

/// Provider adapter over any [`ProviderClient`]
pub struct ProviderAdapter {
    client: Arc<dyn ProviderClient>,
    polling: CheckoutPolling,
}

impl ProviderAdapter {
    pub fn new(client: Arc<dyn ProviderClient>, polling: CheckoutPolling) -> Self {
        Self { client, polling }
    }

    pub fn polling(&self) -> CheckoutPolling {
        self.polling
    }

    async fn fetch_subscription_inner(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Subscription> {
        let path = format!(
            "{}?customer_external_id={}&limit=1",
            SUBSCRIPTIONS_PATH,
            urlencoding::encode(external_customer_id)
        );

        let response = self.client.get(&path).await?.error_for_status()?;
        let list: SubscriptionList = response.json()?;

        let Some(item) = list.items.into_iter().next() else {
            tracing::info!("Provider returned no subscription for customer");
            return Err(BillingError::SubscriptionNotFound);
        };

        let subscription = map_subscription(external_customer_id, item);
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            invoice_count_max = subscription.quota_ceiling(),
            "Fetched subscription from provider"
        );
        Ok(subscription)
    }

    async fn resolve_checkout_inner(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionResponse> {
        let path = format!("{}/{}", CHECKOUTS_PATH, urlencoding::encode(session_id));
        let response = self.client.get(&path).await?;

        if response.status == 404 {
            return Err(BillingError::CheckoutNotFound(session_id.to_string()));
        }

        let checkout: ProviderCheckout = response.error_for_status()?.json()?;
        Ok(map_checkout(checkout))
    }

    /// Bounded confirmation loop.
    ///
    /// Exit table, evaluated after every attempt:
    /// - cancellation fired: `Cancelled`
    /// - status `succeeded`: the session
    /// - non-retryable error: that error
    /// - deadline reached, even mid-fetch: `CheckoutVerificationTimeout` with the
    ///   last seen status
    /// - otherwise: wait for the next tick and try again
    async fn confirm_checkout_inner(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> BillingResult<CheckoutSessionResponse> {
        let started = Instant::now();
        let deadline = started + self.polling.budget;
        let mut last_status: Option<String> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let tick = Instant::now() + self.polling.interval;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BillingError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.confirmation_timeout(started, attempt, last_status));
                }
                result = self.resolve_checkout_inner(session_id) => result,
            };

            match result {
                Ok(session) if session.is_succeeded() => {
                    tracing::info!(attempt, "Checkout confirmed");
                    return Ok(session);
                }
                Ok(session) => {
                    tracing::debug!(attempt, status = %session.status, "Checkout not yet succeeded");
                    last_status = Some(session.status);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Checkout confirmation failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Retryable checkout fetch failure");
                }
            }

            let wake = tick.min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BillingError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                return Err(self.confirmation_timeout(started, attempt, last_status));
            }
        }
    }

    fn confirmation_timeout(
        &self,
        started: Instant,
        attempts: u32,
        last_status: Option<String>,
    ) -> BillingError {
        let last_status = last_status.unwrap_or_else(|| "unknown".to_string());
        tracing::warn!(
            attempts,
            last_status = %last_status,
            "Checkout confirmation timed out"
        );
        BillingError::CheckoutVerificationTimeout {
            last_status,
            elapsed_secs: started.elapsed().as_secs(),
        }
    }

    async fn ingest_usage_inner(
        &self,
        external_customer_id: &str,
        meter_name: &str,
        amount: i64,
    ) -> BillingResult<()> {
        let body = usage_event_payload(external_customer_id, meter_name, amount);
        self.client
            .post(EVENTS_INGEST_PATH, &body)
            .await?
            .error_for_status()?;

        tracing::info!("Usage event ingested");
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for ProviderAdapter {
    async fn fetch_subscription(&self, external_customer_id: &str) -> BillingResult<Subscription> {
        let span = tracing::info_span!("provider.fetch_subscription", external_customer_id = %external_customer_id);
        self.fetch_subscription_inner(external_customer_id)
            .instrument(span)
            .await
    }

    async fn resolve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionResponse> {
        let span = tracing::info_span!("provider.resolve_checkout", session_id = %session_id);
        self.resolve_checkout_inner(session_id).instrument(span).await
    }

    async fn confirm_checkout_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> BillingResult<CheckoutSessionResponse> {
        let span = tracing::info_span!(
            "provider.confirm_checkout",
            session_id = %session_id,
            budget_ms = self.polling.budget.as_millis() as u64,
        );
        self.confirm_checkout_inner(session_id, cancel)
            .instrument(span)
            .await
    }

    async fn ingest_usage_event(
        &self,
        external_customer_id: &str,
        meter_name: &str,
        amount: i64,
    ) -> BillingResult<()> {
        let span = tracing::info_span!(
            "provider.ingest_usage",
            external_customer_id = %external_customer_id,
            meter = %meter_name,
            amount,
        );
        self.ingest_usage_inner(external_customer_id, meter_name, amount)
            .instrument(span)
            .await
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// Meter event body accepted by the provider's ingestion endpoint
pub fn usage_event_payload(
    external_customer_id: &str,
    meter_name: &str,
    amount: i64,
) -> serde_json::Value {
    serde_json::json!({
        "events": [
            {
                "name": meter_name,
                "external_customer_id": external_customer_id,
                "metadata": { "count": amount },
            }
        ]
    })
}

fn map_subscription(external_customer_id: &str, item: ProviderSubscription) -> Subscription {
    let now = OffsetDateTime::now_utc();
    let invoice_count_max = parse_metadata_count(&item.product.metadata, PRODUCT_INVOICE_COUNT_KEY);
    let max_seats = parse_metadata_count(&item.product.metadata, PRODUCT_MAX_SEATS_KEY);

    let mut start = parse_timestamp("current_period_start", item.current_period_start.as_deref());
    let mut end = parse_timestamp("current_period_end", item.current_period_end.as_deref());
    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            tracing::warn!(subscription_id = %item.id, "Provider period is inverted, dropping bounds");
            start = None;
            end = None;
        }
    }

    // canceled_at only makes sense once a cancellation is scheduled or applied
    let canceled_at = parse_timestamp("canceled_at", item.canceled_at.as_deref())
        .filter(|_| is_canceled_status(&item.status) || item.cancel_at_period_end);

    let plan_name = metadata_string(&item.product.metadata, "plan_name")
        .or_else(|| metadata_string(&item.product.metadata, "plan_id"))
        .or_else(|| item.product.name.clone());

    if let Some(linked) = item.customer.external_id.as_deref() {
        if linked != external_customer_id {
            tracing::warn!(
                requested = %external_customer_id,
                returned = %linked,
                "Provider returned a subscription for a different customer"
            );
        }
    }

    Subscription {
        organization_id: Uuid::nil(),
        external_customer_id: external_customer_id.to_string(),
        subscription_id: item.id,
        status: item.status,
        product_id: item.product_id.or(item.product.id).unwrap_or_default(),
        product_name: item.product.name,
        plan_name,
        current_period: BillingPeriod::new(start, end),
        cancel_at_period_end: item.cancel_at_period_end,
        canceled_at,
        metadata: serde_json::json!({
            METADATA_INVOICE_COUNT_MAX: invoice_count_max,
            METADATA_MAX_SEATS: max_seats,
            "product_metadata": item.product.metadata,
            "customer_metadata": item.customer.metadata,
        }),
        created_at: now,
        updated_at: now,
    }
}

fn map_checkout(checkout: ProviderCheckout) -> CheckoutSessionResponse {
    let external_customer_id = checkout
        .customer_external_id
        .filter(|id| !id.is_empty())
        .or_else(|| checkout.customer.and_then(|c| c.external_id))
        .filter(|id| !id.is_empty());

    CheckoutSessionResponse {
        id: checkout.id,
        status: checkout.status,
        external_customer_id,
        subscription_id: checkout
            .subscription
            .and_then(|s| s.id)
            .or(checkout.subscription_id),
        product_id: checkout.product.and_then(|p| p.id).or(checkout.product_id),
        amount: checkout.amount.unwrap_or(0),
        created_at: parse_timestamp("created_at", checkout.created_at.as_deref()),
    }
}

/// Reads a string-typed numeric metadata value. Anything unparseable is zero:
/// an under-provisioned quota is safer than a failed sync.
fn parse_metadata_count(metadata: &HashMap<String, serde_json::Value>, key: &str) -> i32 {
    let parsed = match metadata.get(key) {
        None => return 0,
        Some(serde_json::Value::String(s)) => s.trim().parse::<i32>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Some(_) => None,
    };

    match parsed {
        Some(value) if value >= 0 => value,
        _ => {
            tracing::warn!(key, value = ?metadata.get(key), "Unparseable product metadata, defaulting to 0");
            0
        }
    }
}

fn metadata_string(metadata: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_timestamp(field: &'static str, value: Option<&str>) -> Option<OffsetDateTime> {
    let raw = value?;
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(ts) => Some(ts),
        Err(e) => {
            tracing::warn!(field, value = %raw, error = %e, "Unparseable provider timestamp");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpProviderClient, ProviderResponse};
    use crate::config::BillingConfig;
    use mockito::Matcher;
    use time::macros::datetime;

    fn adapter_for(server: &mockito::ServerGuard) -> ProviderAdapter {
        let config = BillingConfig::new("polar_oat_test", "whsec_test").with_api_url(server.url());
        let client = HttpProviderClient::new(&config).unwrap();
        ProviderAdapter::new(Arc::new(client), CheckoutPolling::default())
    }

    const SUBSCRIPTION_BODY: &str = r#"{
        "items": [{
            "id": "sub_123",
            "status": "active",
            "product_id": "prod_pro",
            "current_period_start": "2026-10-01T00:00:00Z",
            "current_period_end": "2026-11-01T00:00:00Z",
            "cancel_at_period_end": false,
            "canceled_at": null,
            "customer": { "id": "cus_1", "external_id": "org-ext-1", "metadata": {} },
            "product": {
                "id": "prod_pro",
                "name": "Pro",
                "metadata": { "invoice_count": "250", "max_seats": "5", "plan_id": "pro-monthly" }
            }
        }]
    }"#;

    #[tokio::test]
    async fn test_fetch_subscription_maps_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("customer_external_id".into(), "org-ext-1".into()),
                Matcher::UrlEncoded("limit".into(), "1".into()),
            ]))
            .with_status(200)
            .with_body(SUBSCRIPTION_BODY)
            .create_async()
            .await;

        let sub = adapter_for(&server)
            .fetch_subscription("org-ext-1")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(sub.subscription_id, "sub_123");
        assert_eq!(sub.status, "active");
        assert_eq!(sub.product_id, "prod_pro");
        assert_eq!(sub.product_name.as_deref(), Some("Pro"));
        assert_eq!(sub.plan_name.as_deref(), Some("pro-monthly"));
        assert_eq!(sub.quota_ceiling(), 250);
        assert_eq!(sub.max_seats(), 5);
        assert_eq!(
            sub.current_period,
            BillingPeriod::new(
                Some(datetime!(2026-10-01 0:00 UTC)),
                Some(datetime!(2026-11-01 0:00 UTC))
            )
        );
        assert!(sub.canceled_at.is_none());
    }

    #[tokio::test]
    async fn test_fetch_subscription_encodes_customer_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::UrlEncoded(
                "customer_external_id".into(),
                "org ext&1".into(),
            ))
            .with_status(200)
            .with_body(SUBSCRIPTION_BODY)
            .create_async()
            .await;

        let sub = adapter_for(&server)
            .fetch_subscription("org ext&1")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(sub.external_customer_id, "org ext&1");
    }

    #[tokio::test]
    async fn test_fetch_subscription_bad_quota_defaults_to_zero() {
        let mut server = mockito::Server::new_async().await;
        let body = SUBSCRIPTION_BODY.replace(r#""invoice_count": "250""#, r#""invoice_count": "lots""#);
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let sub = adapter_for(&server)
            .fetch_subscription("org-ext-1")
            .await
            .unwrap();
        assert_eq!(sub.quota_ceiling(), 0);
        assert_eq!(sub.status, "active");
    }

    #[tokio::test]
    async fn test_fetch_subscription_empty_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"items":[],"pagination":{"total_count":0}}"#)
            .create_async()
            .await;

        let result = adapter_for(&server).fetch_subscription("org-ext-1").await;
        assert!(matches!(result, Err(BillingError::SubscriptionNotFound)));
    }

    #[tokio::test]
    async fn test_fetch_subscription_server_error_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        match adapter_for(&server).fetch_subscription("org-ext-1").await {
            Err(BillingError::ProviderUnavailable { status, body }) => {
                assert_eq!(status, Some(502));
                assert_eq!(body, "bad gateway");
            }
            other => panic!("expected ProviderUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canceled_at_dropped_without_cancellation() {
        let mut server = mockito::Server::new_async().await;
        let body = SUBSCRIPTION_BODY.replace(
            r#""canceled_at": null"#,
            r#""canceled_at": "2026-10-05T00:00:00Z""#,
        );
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let sub = adapter_for(&server)
            .fetch_subscription("org-ext-1")
            .await
            .unwrap();
        assert!(sub.canceled_at.is_none());
        assert!(sub.validate().is_ok());
    }

    #[tokio::test]
    async fn test_resolve_checkout_maps_external_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/checkouts/custom/chk_9")
            .with_status(200)
            .with_body(
                r#"{
                    "id": "chk_9",
                    "status": "succeeded",
                    "amount": 2900,
                    "customer_external_id": null,
                    "customer": { "external_id": "org-ext-9" },
                    "product": { "id": "prod_pro" },
                    "subscription": { "id": "sub_9" },
                    "created_at": "2026-10-17T09:30:00Z"
                }"#,
            )
            .create_async()
            .await;

        let session = adapter_for(&server)
            .resolve_checkout_session("chk_9")
            .await
            .unwrap();
        assert!(session.is_succeeded());
        assert_eq!(session.external_customer_id.as_deref(), Some("org-ext-9"));
        assert_eq!(session.subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(session.product_id.as_deref(), Some("prod_pro"));
        assert_eq!(session.amount, 2900);
        assert_eq!(session.created_at, Some(datetime!(2026-10-17 9:30 UTC)));
    }

    #[tokio::test]
    async fn test_resolve_checkout_404_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/checkouts/custom/chk_missing")
            .with_status(404)
            .with_body(r#"{"detail":"Not found"}"#)
            .create_async()
            .await;

        let result = adapter_for(&server)
            .resolve_checkout_session("chk_missing")
            .await;
        assert!(matches!(result, Err(BillingError::CheckoutNotFound(id)) if id == "chk_missing"));
    }

    #[tokio::test]
    async fn test_ingest_usage_event_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/events/ingest")
            .match_body(Matcher::Json(serde_json::json!({
                "events": [{
                    "name": "invoice_processing",
                    "external_customer_id": "org-ext-1",
                    "metadata": { "count": 1 }
                }]
            })))
            .with_status(200)
            .with_body(r#"{"inserted":1}"#)
            .create_async()
            .await;

        adapter_for(&server)
            .ingest_usage_event("org-ext-1", "invoice_processing", 1)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ingest_usage_event_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/events/ingest")
            .with_status(422)
            .with_body("unknown customer")
            .create_async()
            .await;

        let result = adapter_for(&server)
            .ingest_usage_event("org-ext-1", "invoice_processing", 1)
            .await;
        assert!(matches!(
            result,
            Err(BillingError::ProviderUnavailable { status: Some(422), .. })
        ));
    }

    #[test]
    fn test_metadata_count_parsing() {
        let mut metadata = HashMap::new();
        metadata.insert("invoice_count".to_string(), serde_json::json!(" 40 "));
        metadata.insert("max_seats".to_string(), serde_json::json!(3));
        metadata.insert("negative".to_string(), serde_json::json!("-2"));
        metadata.insert("huge".to_string(), serde_json::json!("99999999999"));

        assert_eq!(parse_metadata_count(&metadata, "invoice_count"), 40);
        assert_eq!(parse_metadata_count(&metadata, "max_seats"), 3);
        assert_eq!(parse_metadata_count(&metadata, "negative"), 0);
        assert_eq!(parse_metadata_count(&metadata, "huge"), 0);
        assert_eq!(parse_metadata_count(&metadata, "absent"), 0);
    }

    // -------------------------------------------------------------------------
    // Confirmation loop, driven by a scripted client under paused time
    // -------------------------------------------------------------------------

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Step {
        Checkout(&'static str),
        Http(u16),
        Transport,
        Slow(u64, &'static str),
    }

    struct ScriptedClient {
        steps: Mutex<VecDeque<Step>>,
        fallback: Step,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn get(&self, _path: &str) -> BillingResult<ProviderResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Checkout(status) => Ok(ProviderResponse::new(
                    200,
                    format!(r#"{{"id":"chk_1","status":"{}","amount":900}}"#, status),
                )),
                Step::Http(code) => Ok(ProviderResponse::new(code, "scripted")),
                Step::Transport => Err(BillingError::transport("connection reset")),
                Step::Slow(secs, status) => {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    Ok(ProviderResponse::new(
                        200,
                        format!(r#"{{"id":"chk_1","status":"{}","amount":900}}"#, status),
                    ))
                }
            }
        }

        async fn post(
            &self,
            _path: &str,
            _body: &serde_json::Value,
        ) -> BillingResult<ProviderResponse> {
            Ok(ProviderResponse::new(200, "{}"))
        }
    }

    fn scripted(client: &Arc<ScriptedClient>) -> ProviderAdapter {
        ProviderAdapter::new(client.clone(), CheckoutPolling::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_succeeds_on_fourth_attempt() {
        let client = ScriptedClient::new(
            vec![
                Step::Checkout("open"),
                Step::Checkout("confirmed"),
                Step::Checkout("confirmed"),
            ],
            Step::Checkout("succeeded"),
        );
        let started = Instant::now();

        let session = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(session.is_succeeded());
        assert_eq!(client.calls(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_times_out_with_last_status() {
        let client = ScriptedClient::new(vec![], Step::Checkout("confirmed"));
        let started = Instant::now();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        match result {
            Err(BillingError::CheckoutVerificationTimeout {
                last_status,
                elapsed_secs,
            }) => {
                assert_eq!(last_status, "confirmed");
                assert_eq!(elapsed_secs, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(client.calls(), 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_cannot_stretch_the_budget() {
        let client = ScriptedClient::new(vec![], Step::Slow(9, "open"));
        let started = Instant::now();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        match result {
            Err(BillingError::CheckoutVerificationTimeout {
                last_status,
                elapsed_secs,
            }) => {
                assert_eq!(last_status, "open");
                assert_eq!(elapsed_secs, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(client.calls(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_first_fetch_times_out_as_unknown() {
        let client = ScriptedClient::new(vec![], Step::Slow(60, "succeeded"));
        let started = Instant::now();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BillingError::CheckoutVerificationTimeout { ref last_status, .. }) if last_status == "unknown"
        ));
        assert_eq!(client.calls(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_timeout_without_any_status_reports_unknown() {
        let client = ScriptedClient::new(vec![], Step::Transport);

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BillingError::CheckoutVerificationTimeout { ref last_status, .. }) if last_status == "unknown"
        ));
        assert_eq!(client.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_not_found_returns_immediately() {
        let client = ScriptedClient::new(vec![Step::Http(404)], Step::Checkout("succeeded"));
        let started = Instant::now();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(BillingError::CheckoutNotFound(_))));
        assert_eq!(client.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_unauthorized_is_not_retried() {
        let client = ScriptedClient::new(vec![Step::Http(401)], Step::Checkout("succeeded"));

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BillingError::ProviderUnavailable { status: Some(401), .. })
        ));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_retries_server_errors() {
        let client = ScriptedClient::new(
            vec![Step::Http(503), Step::Transport],
            Step::Checkout("succeeded"),
        );
        let started = Instant::now();

        let session = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(session.is_succeeded());
        assert_eq!(client.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_keeps_polling() {
        let client = ScriptedClient::new(vec![Step::Checkout("failed")], Step::Checkout("succeeded"));

        let session = scripted(&client)
            .confirm_checkout_session("chk_1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(session.is_succeeded());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_stops_on_cancellation() {
        let client = ScriptedClient::new(vec![], Step::Checkout("open"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &cancel)
            .await;

        assert!(matches!(result, Err(BillingError::Cancelled)));
        assert_eq!(client.calls(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_makes_no_calls() {
        let client = ScriptedClient::new(vec![], Step::Checkout("succeeded"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scripted(&client)
            .confirm_checkout_session("chk_1", &cancel)
            .await;

        assert!(matches!(result, Err(BillingError::Cancelled)));
        assert_eq!(client.calls(), 0);
    }
}
