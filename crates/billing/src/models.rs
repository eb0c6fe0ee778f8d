//! Billing domain entities
//!
//! `Subscription` and `QuotaTracking` are the locally persisted projection of
//! provider state. `QuotaStatus` is derived from both and is what request-time
//! access gating reads.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Provider statuses that count as an active subscription
pub const ACTIVE_STATUSES: &[&str] = &["active", "trialing"];

/// Provider statuses that mean the subscription has been cancelled or revoked
pub const CANCELED_STATUSES: &[&str] = &["canceled", "revoked"];

/// Checkout status the provider reports once payment completed
pub const CHECKOUT_SUCCEEDED: &str = "succeeded";

/// Metadata key holding the parsed quota ceiling
pub const METADATA_INVOICE_COUNT_MAX: &str = "invoice_count_max";

/// Metadata key holding the parsed seat limit
pub const METADATA_MAX_SEATS: &str = "max_seats";

pub fn is_active_status(status: &str) -> bool {
    ACTIVE_STATUSES.contains(&status)
}

pub fn is_canceled_status(status: &str) -> bool {
    CANCELED_STATUSES.contains(&status)
}

/// Half-open billing period `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

impl BillingPeriod {
    pub fn new(start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Self {
        Self { start, end }
    }

    /// Both bounds present and `start < end`, or at least one bound absent.
    pub fn is_well_formed(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start < end,
            _ => true,
        }
    }

    /// `now` lies in `[start, end)`. An open bound never contains anything.
    pub fn contains(&self, now: OffsetDateTime) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= now && now < end,
            _ => false,
        }
    }
}

/// Subscription record, one per organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub organization_id: Uuid,
    pub external_customer_id: String,
    pub subscription_id: String,
    pub status: String,
    pub product_id: String,
    pub product_name: Option<String>,
    pub plan_name: Option<String>,
    pub current_period: BillingPeriod,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    /// Opaque provider metadata
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        is_active_status(&self.status)
    }

    /// Quota ceiling recorded by the provider adapter, zero when absent.
    pub fn quota_ceiling(&self) -> i32 {
        metadata_i32(&self.metadata, METADATA_INVOICE_COUNT_MAX)
    }

    pub fn max_seats(&self) -> i32 {
        metadata_i32(&self.metadata, METADATA_MAX_SEATS)
    }

    /// Checks the record invariants before it is written.
    pub fn validate(&self) -> Result<(), String> {
        if !self.current_period.is_well_formed() {
            return Err(format!(
                "current period start must precede end for subscription {}",
                self.subscription_id
            ));
        }
        if self.canceled_at.is_some() && !is_canceled_status(&self.status) && !self.cancel_at_period_end {
            return Err(format!(
                "canceled_at set on subscription {} with status {}",
                self.subscription_id, self.status
            ));
        }
        Ok(())
    }
}

fn metadata_i32(metadata: &serde_json::Value, key: &str) -> i32 {
    metadata
        .get(key)
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0)
}

/// Remaining usage credits for an organization's current period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTracking {
    pub organization_id: Uuid,
    pub invoice_count: i32,
    pub max_seats: i32,
    pub period: BillingPeriod,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_synced_at: Option<OffsetDateTime>,
}

impl QuotaTracking {
    /// Applies a provider sync to an existing quota row.
    ///
    /// A later period (or no prior row) starts from the full ceiling. Within the
    /// same period the remaining count only ever shrinks to the ceiling, so a
    /// redelivered webhook cannot refill credits already consumed. A period
    /// that starts before the stored one comes from a sync that finished out
    /// of order and yields `None`: the stored row stays as it is.
    pub fn reconciled(
        existing: Option<&QuotaTracking>,
        organization_id: Uuid,
        ceiling: i32,
        max_seats: i32,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> Option<QuotaTracking> {
        let ceiling = ceiling.max(0);
        let invoice_count = match existing {
            None => ceiling,
            Some(current) => match (current.period.start, period.start) {
                (stored, incoming) if stored == incoming => current.invoice_count.min(ceiling),
                (None, Some(_)) => ceiling,
                (Some(stored), Some(incoming)) if incoming > stored => ceiling,
                _ => return None,
            },
        };

        Some(QuotaTracking {
            organization_id,
            invoice_count,
            max_seats,
            period,
            last_synced_at: Some(now),
        })
    }
}

/// Read-only projection consumed by access-control middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub organization_id: Uuid,
    pub subscription_status: String,
    pub current_period: BillingPeriod,
    pub cancel_at_period_end: bool,
    pub invoice_count: i32,
    pub max_seats: i32,
    pub can_process_invoice: bool,
}

impl QuotaStatus {
    /// Builds the status from one joined read of subscription and quota.
    pub fn compute(
        organization_id: Uuid,
        subscription_status: &str,
        current_period: BillingPeriod,
        cancel_at_period_end: bool,
        invoice_count: i32,
        max_seats: i32,
        now: OffsetDateTime,
    ) -> Self {
        let can_process_invoice = is_active_status(subscription_status)
            && invoice_count > 0
            && current_period.contains(now);

        Self {
            organization_id,
            subscription_status: subscription_status.to_string(),
            current_period,
            cancel_at_period_end,
            invoice_count,
            max_seats,
            can_process_invoice,
        }
    }
}

/// Transient checkout session as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionResponse {
    pub id: String,
    pub status: String,
    /// External customer ID (our organization key on the provider side)
    pub external_customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub product_id: Option<String>,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl CheckoutSessionResponse {
    pub fn is_succeeded(&self) -> bool {
        self.status == CHECKOUT_SUCCEEDED
    }
}

/// Why an organization can or cannot process invoices right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatusReason {
    Active,
    NoSubscription,
    SubscriptionInactive,
    QuotaExhausted,
    OutsideBillingPeriod,
}

impl BillingStatusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatusReason::Active => "ACTIVE",
            BillingStatusReason::NoSubscription => "NO_SUBSCRIPTION",
            BillingStatusReason::SubscriptionInactive => "SUBSCRIPTION_INACTIVE",
            BillingStatusReason::QuotaExhausted => "QUOTA_EXHAUSTED",
            BillingStatusReason::OutsideBillingPeriod => "OUTSIDE_BILLING_PERIOD",
        }
    }
}

impl std::fmt::Display for BillingStatusReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot returned to clients after payment verification or a status check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingStatus {
    pub organization_id: Uuid,
    pub external_id: Option<String>,
    pub has_active_subscription: bool,
    pub can_process_invoices: bool,
    pub invoice_count: i32,
    pub reason: BillingStatusReason,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

impl BillingStatus {
    pub fn from_quota_status(
        status: &QuotaStatus,
        external_id: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let has_active_subscription = is_active_status(&status.subscription_status);
        let reason = if status.can_process_invoice {
            BillingStatusReason::Active
        } else if !has_active_subscription {
            BillingStatusReason::SubscriptionInactive
        } else if status.invoice_count <= 0 {
            BillingStatusReason::QuotaExhausted
        } else {
            BillingStatusReason::OutsideBillingPeriod
        };

        Self {
            organization_id: status.organization_id,
            external_id,
            has_active_subscription,
            can_process_invoices: status.can_process_invoice,
            invoice_count: status.invoice_count,
            reason,
            checked_at: now,
        }
    }

    pub fn no_subscription(
        organization_id: Uuid,
        external_id: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            organization_id,
            external_id,
            has_active_subscription: false,
            can_process_invoices: false,
            invoice_count: 0,
            reason: BillingStatusReason::NoSubscription,
            checked_at: now,
        }
    }
}
