use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    SubscriptionRepository, PROCESSING_TIMEOUT_MINUTES, WEBHOOK_ERROR, WEBHOOK_PROCESSING,
    WEBHOOK_SUCCESS,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{BillingPeriod, QuotaStatus, QuotaTracking, Subscription};

/// Apply the billing schema migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(format!("failed to run billing migrations: {}", e)))
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    organization_id: Uuid,
    external_customer_id: String,
    subscription_id: String,
    status: String,
    product_id: String,
    product_name: Option<String>,
    plan_name: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            organization_id: row.organization_id,
            external_customer_id: row.external_customer_id,
            subscription_id: row.subscription_id,
            status: row.status,
            product_id: row.product_id,
            product_name: row.product_name,
            plan_name: row.plan_name,
            current_period: BillingPeriod::new(row.current_period_start, row.current_period_end),
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaRow {
    organization_id: Uuid,
    invoice_count: i32,
    max_seats: i32,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    last_synced_at: Option<OffsetDateTime>,
}

impl From<QuotaRow> for QuotaTracking {
    fn from(row: QuotaRow) -> Self {
        QuotaTracking {
            organization_id: row.organization_id,
            invoice_count: row.invoice_count,
            max_seats: row.max_seats,
            period: BillingPeriod::new(row.period_start, row.period_end),
            last_synced_at: row.last_synced_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaStatusRow {
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    invoice_count: i32,
    max_seats: i32,
}

const SUBSCRIPTION_COLUMNS: &str = "organization_id, external_customer_id, subscription_id, status, \
     product_id, product_name, plan_name, current_period_start, current_period_end, \
     cancel_at_period_end, canceled_at, metadata, created_at, updated_at";

const QUOTA_COLUMNS: &str =
    "organization_id, invoice_count, max_seats, period_start, period_end, last_synced_at";

/// Postgres-backed repository
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(operation: &'static str, organization_id: Uuid) -> impl FnOnce(sqlx::Error) -> BillingError {
    move |e| {
        tracing::error!(org_id = %organization_id, operation, error = %e, "Billing database operation failed");
        BillingError::Database(format!("{}: {}", operation, e))
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn get_subscription(&self, organization_id: Uuid) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_subscriptions WHERE organization_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get subscription", organization_id))?;

        row.map(Subscription::from)
            .ok_or(BillingError::SubscriptionNotFound)
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        subscription
            .validate()
            .map_err(BillingError::InvalidSubscription)?;

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_subscriptions (
                organization_id, external_customer_id, subscription_id, status,
                product_id, product_name, plan_name,
                current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, metadata,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW())
            ON CONFLICT (organization_id) DO UPDATE SET
                external_customer_id = EXCLUDED.external_customer_id,
                subscription_id = EXCLUDED.subscription_id,
                status = EXCLUDED.status,
                product_id = EXCLUDED.product_id,
                product_name = EXCLUDED.product_name,
                plan_name = EXCLUDED.plan_name,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.organization_id)
        .bind(&subscription.external_customer_id)
        .bind(&subscription.subscription_id)
        .bind(&subscription.status)
        .bind(&subscription.product_id)
        .bind(&subscription.product_name)
        .bind(&subscription.plan_name)
        .bind(subscription.current_period.start)
        .bind(subscription.current_period.end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(&subscription.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("upsert subscription", subscription.organization_id))?;

        tracing::debug!(
            org_id = %subscription.organization_id,
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            "Subscription upserted"
        );
        Ok(row.into())
    }

    async fn delete_subscription(&self, organization_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM billing_subscriptions WHERE organization_id = $1")
            .bind(organization_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete subscription", organization_id))?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_subscriptions ORDER BY organization_id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(format!("list subscriptions: {}", e)))?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn get_quota(&self, organization_id: Uuid) -> BillingResult<QuotaTracking> {
        let row: Option<QuotaRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_quota_tracking WHERE organization_id = $1",
            QUOTA_COLUMNS
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get quota", organization_id))?;

        row.map(QuotaTracking::from)
            .ok_or(BillingError::QuotaNotFound)
    }

    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<QuotaTracking> {
        let row: QuotaRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_quota_tracking
                (organization_id, invoice_count, max_seats, period_start, period_end, last_synced_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (organization_id) DO UPDATE SET
                invoice_count = EXCLUDED.invoice_count,
                max_seats = EXCLUDED.max_seats,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                last_synced_at = EXCLUDED.last_synced_at
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(quota.organization_id)
        .bind(quota.invoice_count)
        .bind(quota.max_seats)
        .bind(quota.period.start)
        .bind(quota.period.end)
        .bind(quota.last_synced_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("upsert quota", quota.organization_id))?;
        Ok(row.into())
    }

    async fn delete_quota(&self, organization_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM billing_quota_tracking WHERE organization_id = $1")
            .bind(organization_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete quota", organization_id))?;
        Ok(())
    }

    async fn decrement_invoice_count(&self, organization_id: Uuid) -> BillingResult<QuotaTracking> {
        // Conditional update: the row lock serialises racing callers and the
        // predicate re-checks the count after the lock is taken
        let row: Option<QuotaRow> = sqlx::query_as(&format!(
            r#"
            UPDATE billing_quota_tracking
            SET invoice_count = invoice_count - 1
            WHERE organization_id = $1 AND invoice_count > 0
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("decrement invoice count", organization_id))?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM billing_quota_tracking WHERE organization_id = $1)",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("check quota existence", organization_id))?;

        if exists {
            Err(BillingError::QuotaExhausted)
        } else {
            Err(BillingError::QuotaNotFound)
        }
    }

    async fn get_quota_status(&self, organization_id: Uuid) -> BillingResult<QuotaStatus> {
        let row: Option<QuotaStatusRow> = sqlx::query_as(
            r#"
            SELECT
                s.status,
                s.current_period_start,
                s.current_period_end,
                s.cancel_at_period_end,
                COALESCE(q.invoice_count, 0) AS invoice_count,
                COALESCE(q.max_seats, 0) AS max_seats
            FROM billing_subscriptions s
            LEFT JOIN billing_quota_tracking q ON q.organization_id = s.organization_id
            WHERE s.organization_id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get quota status", organization_id))?;

        let row = row.ok_or(BillingError::SubscriptionNotFound)?;
        Ok(QuotaStatus::compute(
            organization_id,
            &row.status,
            BillingPeriod::new(row.current_period_start, row.current_period_end),
            row.cancel_at_period_end,
            row.invoice_count,
            row.max_seats,
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
        let row: Option<QuotaRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_quota_tracking
                (organization_id, invoice_count, max_seats, period_start, period_end, last_synced_at)
            VALUES ($1, GREATEST($2, 0), $3, $4, $5, NOW())
            ON CONFLICT (organization_id) DO UPDATE SET
                invoice_count = CASE
                    WHEN billing_quota_tracking.period_start IS NOT DISTINCT FROM EXCLUDED.period_start
                        THEN LEAST(billing_quota_tracking.invoice_count, EXCLUDED.invoice_count)
                    ELSE EXCLUDED.invoice_count
                END,
                max_seats = EXCLUDED.max_seats,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                last_synced_at = EXCLUDED.last_synced_at
            WHERE billing_quota_tracking.period_start IS NOT DISTINCT FROM EXCLUDED.period_start
               OR billing_quota_tracking.period_start IS NULL
               OR EXCLUDED.period_start > billing_quota_tracking.period_start
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(organization_id)
        .bind(ceiling)
        .bind(max_seats)
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("reconcile quota", organization_id))?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                // Conflict row kept: the sync carried an older period
                tracing::warn!(org_id = %organization_id, "Skipping quota sync for an older period");
                self.get_quota(organization_id).await
            }
        }
    }

    async fn claim_webhook_event(&self, webhook_id: &str, event_type: &str) -> BillingResult<bool> {
        // Failed deliveries and claims stuck in processing can be taken over;
        // successful or in-flight ones cannot
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events
                (webhook_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (webhook_id) DO UPDATE SET
                processing_result = EXCLUDED.processing_result,
                processing_started_at = NOW(),
                processed_at = NULL,
                attempts = billing_webhook_events.attempts + 1
            WHERE billing_webhook_events.processing_result = $4
               OR (billing_webhook_events.processing_result = $3
                   AND billing_webhook_events.processing_started_at < NOW() - make_interval(mins => $5))
            RETURNING webhook_id
            "#,
        )
        .bind(webhook_id)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING)
        .bind(WEBHOOK_ERROR)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(webhook_id = %webhook_id, error = %e, "Failed to claim webhook delivery");
            BillingError::Database(format!("claim webhook event: {}", e))
        })?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(&self, webhook_id: &str, error: Option<&str>) -> BillingResult<()> {
        let result = if error.is_some() {
            WEBHOOK_ERROR
        } else {
            WEBHOOK_SUCCESS
        };

        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2, processed_at = NOW()
            WHERE webhook_id = $3
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(webhook_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                webhook_id = %webhook_id,
                processing_result = result,
                error = %e,
                "Failed to record webhook outcome; delivery may appear stuck in processing"
            );
            BillingError::Database(format!("finish webhook event: {}", e))
        })?;
        Ok(())
    }
}
