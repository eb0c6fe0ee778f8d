use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    SubscriptionRepository, PROCESSING_TIMEOUT_MINUTES, WEBHOOK_ERROR, WEBHOOK_PROCESSING,
    WEBHOOK_SUCCESS,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{BillingPeriod, QuotaStatus, QuotaTracking, Subscription};

#[derive(Debug, Clone)]
struct WebhookRecord {
    event_type: String,
    result: &'static str,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    subscriptions: HashMap<Uuid, Subscription>,
    quotas: HashMap<Uuid, QuotaTracking>,
    webhooks: HashMap<String, WebhookRecord>,
}

/// Process-local repository.
///
/// One mutex guards all tables, so each operation is a single critical section
/// and the conditional decrement is atomic.
pub struct InMemorySubscriptionRepository {
    tables: Mutex<Tables>,
    processing_timeout: time::Duration,
}

impl Default for InMemorySubscriptionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            processing_timeout: time::Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES)),
        }
    }

    /// Override how long a `processing` webhook claim is honoured
    pub fn with_processing_timeout(mut self, timeout: time::Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Ledger state of a delivery, if recorded
    pub async fn webhook_status(&self, webhook_id: &str) -> Option<(String, Option<String>)> {
        let tables = self.tables.lock().await;
        tables
            .webhooks
            .get(webhook_id)
            .map(|r| (r.result.to_string(), r.error_message.clone()))
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn get_subscription(&self, organization_id: Uuid) -> BillingResult<Subscription> {
        let tables = self.tables.lock().await;
        tables
            .subscriptions
            .get(&organization_id)
            .cloned()
            .ok_or(BillingError::SubscriptionNotFound)
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        subscription
            .validate()
            .map_err(BillingError::InvalidSubscription)?;

        let mut tables = self.tables.lock().await;
        let mut stored = subscription.clone();
        stored.updated_at = OffsetDateTime::now_utc();
        if let Some(existing) = tables.subscriptions.get(&subscription.organization_id) {
            stored.created_at = existing.created_at;
        }
        tables
            .subscriptions
            .insert(subscription.organization_id, stored.clone());
        Ok(stored)
    }

    async fn delete_subscription(&self, organization_id: Uuid) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .subscriptions
            .remove(&organization_id);
        Ok(())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        let mut subscriptions: Vec<_> = tables.subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.organization_id);
        Ok(subscriptions)
    }

    async fn get_quota(&self, organization_id: Uuid) -> BillingResult<QuotaTracking> {
        let tables = self.tables.lock().await;
        tables
            .quotas
            .get(&organization_id)
            .cloned()
            .ok_or(BillingError::QuotaNotFound)
    }

    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<QuotaTracking> {
        if quota.invoice_count < 0 {
            return Err(BillingError::InvalidSubscription(format!(
                "negative invoice count for organization {}",
                quota.organization_id
            )));
        }
        self.tables
            .lock()
            .await
            .quotas
            .insert(quota.organization_id, quota.clone());
        Ok(quota.clone())
    }

    async fn delete_quota(&self, organization_id: Uuid) -> BillingResult<()> {
        self.tables.lock().await.quotas.remove(&organization_id);
        Ok(())
    }

    async fn decrement_invoice_count(&self, organization_id: Uuid) -> BillingResult<QuotaTracking> {
        let mut tables = self.tables.lock().await;
        let quota = tables
            .quotas
            .get_mut(&organization_id)
            .ok_or(BillingError::QuotaNotFound)?;

        if quota.invoice_count <= 0 {
            return Err(BillingError::QuotaExhausted);
        }
        quota.invoice_count -= 1;
        Ok(quota.clone())
    }

    async fn get_quota_status(&self, organization_id: Uuid) -> BillingResult<QuotaStatus> {
        let tables = self.tables.lock().await;
        let subscription = tables
            .subscriptions
            .get(&organization_id)
            .ok_or(BillingError::SubscriptionNotFound)?;
        let (invoice_count, max_seats) = tables
            .quotas
            .get(&organization_id)
            .map(|q| (q.invoice_count, q.max_seats))
            .unwrap_or((0, 0));

        Ok(QuotaStatus::compute(
            organization_id,
            &subscription.status,
            subscription.current_period,
            subscription.cancel_at_period_end,
            invoice_count,
            max_seats,
            OffsetDateTime::now_utc(),
        ))
    }

    async fn reconcile_quota(
        &self,
        organization_id: Uuid,
        ceiling: i32,
        max_seats: i32,
        period: BillingPeriod,
    ) -> BillingResult<QuotaTracking> {
        let mut tables = self.tables.lock().await;
        let existing = tables.quotas.get(&organization_id);
        let Some(quota) = QuotaTracking::reconciled(
            existing,
            organization_id,
            ceiling,
            max_seats,
            period,
            OffsetDateTime::now_utc(),
        ) else {
            tracing::warn!(org_id = %organization_id, "Skipping quota sync for an older period");
            return existing
                .cloned()
                .ok_or(BillingError::QuotaNotFound);
        };
        tables.quotas.insert(organization_id, quota.clone());
        Ok(quota)
    }

    async fn claim_webhook_event(&self, webhook_id: &str, event_type: &str) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.webhooks.get(webhook_id) {
            let reclaimable = existing.result == WEBHOOK_ERROR
                || (existing.result == WEBHOOK_PROCESSING
                    && existing.started_at < now - self.processing_timeout);
            if !reclaimable {
                tracing::debug!(
                    webhook_id = %webhook_id,
                    event_type = %existing.event_type,
                    processing_result = existing.result,
                    "Webhook delivery already claimed"
                );
                return Ok(false);
            }
        }

        tables.webhooks.insert(
            webhook_id.to_string(),
            WebhookRecord {
                event_type: event_type.to_string(),
                result: WEBHOOK_PROCESSING,
                started_at: now,
                error_message: None,
            },
        );
        Ok(true)
    }

    async fn finish_webhook_event(&self, webhook_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.webhooks.get_mut(webhook_id) {
            record.result = if error.is_some() {
                WEBHOOK_ERROR
            } else {
                WEBHOOK_SUCCESS
            };
            record.error_message = error.map(str::to_string);
        } else {
            tracing::warn!(webhook_id = %webhook_id, "Finishing a webhook delivery that was never claimed");
        }
        Ok(())
    }
}
