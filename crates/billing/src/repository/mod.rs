//! Subscription and quota persistence
//!
//! Every write is keyed by organization ID and idempotent. Two backends share
//! the contract: [`PgSubscriptionRepository`] for production and
//! [`InMemorySubscriptionRepository`] for tests and local runs.

mod memory;
mod postgres;

pub use memory::InMemorySubscriptionRepository;
pub use postgres::{run_migrations, PgSubscriptionRepository};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BillingPeriod, QuotaStatus, QuotaTracking, Subscription};

/// A `processing` webhook claim older than this may be taken over
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Ledger states for webhook deliveries
pub const WEBHOOK_PROCESSING: &str = "processing";
pub const WEBHOOK_SUCCESS: &str = "success";
pub const WEBHOOK_ERROR: &str = "error";

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// `SubscriptionNotFound` when the organization has no record
    async fn get_subscription(&self, organization_id: Uuid) -> BillingResult<Subscription>;

    /// Insert or replace the organization's subscription (last write wins).
    /// `created_at` of an existing row is preserved. Returns the stored row.
    async fn upsert_subscription(&self, subscription: &Subscription)
        -> BillingResult<Subscription>;

    /// Removing an absent row is not an error
    async fn delete_subscription(&self, organization_id: Uuid) -> BillingResult<()>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    /// `QuotaNotFound` when the organization has no quota row
    async fn get_quota(&self, organization_id: Uuid) -> BillingResult<QuotaTracking>;

    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<QuotaTracking>;

    async fn delete_quota(&self, organization_id: Uuid) -> BillingResult<()>;

    /// Atomically consume one invoice credit.
    ///
    /// Returns the updated row. `QuotaExhausted` when the count is already
    /// zero, `QuotaNotFound` when there is no row. The count never goes below
    /// zero, however many callers race.
    async fn decrement_invoice_count(&self, organization_id: Uuid) -> BillingResult<QuotaTracking>;

    /// Single joined read of subscription and quota.
    ///
    /// `SubscriptionNotFound` without a subscription; a missing quota row
    /// reads as zero credits.
    async fn get_quota_status(&self, organization_id: Uuid) -> BillingResult<QuotaStatus>;

    /// Apply a provider sync to the quota row in one atomic step.
    ///
    /// A later period start (or no row) resets the count to `ceiling`; the
    /// same period clamps the count to `min(stored, ceiling)`. A period that
    /// starts before the stored one leaves the row untouched and returns it.
    async fn reconcile_quota(
        &self,
        organization_id: Uuid,
        ceiling: i32,
        max_seats: i32,
        period: BillingPeriod,
    ) -> BillingResult<QuotaTracking>;

    /// Claim exclusive processing of a webhook delivery.
    ///
    /// `false` means the delivery already succeeded or is being processed.
    /// Failed and stuck deliveries can be claimed again.
    async fn claim_webhook_event(&self, webhook_id: &str, event_type: &str) -> BillingResult<bool>;

    /// Record the outcome of a claimed delivery
    async fn finish_webhook_event(&self, webhook_id: &str, error: Option<&str>) -> BillingResult<()>;
}
