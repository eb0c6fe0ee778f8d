//! Billing orchestration
//!
//! `BillingService` is the only writer of subscription and quota state. It
//! wires signature verification, the provider adapter, the organization
//! directory and the repository together; all collaborators are injected at
//! construction.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::client::HttpProviderClient;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{BillingStatus, QuotaStatus, QuotaTracking, Subscription};
use crate::organizations::{OrganizationAdapter, PgOrganizationAdapter};
use crate::provider::{BillingProvider, ProviderAdapter};
use crate::repository::{PgSubscriptionRepository, SubscriptionRepository};
use crate::signature::SignatureVerifier;
use crate::webhooks::{parse_event, WebhookAction, WebhookOutcome, WebhookRequest};

/// Request-time gate read by access-control middleware
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Never calls the provider. A missing subscription reads as `false`;
    /// storage failures are returned so callers can tell them apart.
    async fn is_active_and_within_quota(&self, organization_id: Uuid) -> BillingResult<bool>;
}

/// Outcome of charging one invoice against the quota
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceCharge {
    /// Quota row after the decrement
    pub quota: QuotaTracking,
    /// Whether the usage event reached the provider
    pub usage_reported: bool,
}

/// Per-organization result of a scheduled resync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncResult {
    Synced {
        organization_id: Uuid,
        status: String,
        invoice_count: i32,
    },
    NotFound {
        organization_id: Uuid,
    },
    Error {
        organization_id: Uuid,
        error: String,
    },
}

/// State written by one sync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedSubscription {
    pub subscription: Subscription,
    pub quota: QuotaTracking,
}

pub struct BillingService {
    repository: Arc<dyn SubscriptionRepository>,
    organizations: Arc<dyn OrganizationAdapter>,
    provider: Arc<dyn BillingProvider>,
    verifier: SignatureVerifier,
    meter_slug: String,
}

impl BillingService {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        organizations: Arc<dyn OrganizationAdapter>,
        provider: Arc<dyn BillingProvider>,
        verifier: SignatureVerifier,
        meter_slug: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            organizations,
            provider,
            verifier,
            meter_slug: meter_slug.into(),
        }
    }

    /// Production wiring: reqwest provider client and Postgres storage
    pub fn from_config(config: &BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let client = HttpProviderClient::new(config)?;
        let provider = ProviderAdapter::new(Arc::new(client), config.polling);
        let verifier = SignatureVerifier::new(config.webhook_secret.clone())
            .with_tolerance(config.webhook_tolerance_secs);

        Ok(Self::new(
            Arc::new(PgSubscriptionRepository::new(pool.clone())),
            Arc::new(PgOrganizationAdapter::new(pool)),
            Arc::new(provider),
            verifier,
            config.meter_slug.clone(),
        ))
    }

    pub fn repository(&self) -> &Arc<dyn SubscriptionRepository> {
        &self.repository
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Verify, deduplicate and apply one webhook delivery.
    ///
    /// Signature failures and provider failures are returned to the caller;
    /// the provider redelivers on a non-2xx answer.
    pub async fn handle_webhook(&self, request: &WebhookRequest) -> BillingResult<WebhookOutcome> {
        let span = tracing::info_span!("billing.webhook", webhook_id = %request.webhook_id);
        async move {
            if let Err(e) = self.verifier.verify(
                &request.webhook_id,
                &request.timestamp,
                &request.body,
                &request.signature,
            ) {
                tracing::warn!(error = %e, "Rejected webhook delivery");
                return Err(BillingError::Signature(e));
            }

            let event = parse_event(&request.body)?;
            let external_customer_id = match event.action {
                WebhookAction::Ignore => {
                    return Ok(WebhookOutcome::Ignored {
                        event_type: event.event_type,
                    })
                }
                WebhookAction::Sync {
                    external_customer_id,
                } => external_customer_id,
            };

            if !self
                .repository
                .claim_webhook_event(&request.webhook_id, &event.event_type)
                .await?
            {
                tracing::info!(event_type = %event.event_type, "Duplicate webhook delivery");
                return Ok(WebhookOutcome::Duplicate);
            }

            tracing::info!(
                event_type = %event.event_type,
                external_customer_id = %external_customer_id,
                "Processing webhook delivery"
            );

            let result = self.sync_external_customer(&external_customer_id).await;

            let error_message = result.as_ref().err().map(|e| e.to_string());
            if let Err(e) = self
                .repository
                .finish_webhook_event(&request.webhook_id, error_message.as_deref())
                .await
            {
                tracing::error!(error = %e, "Failed to record webhook outcome");
            }

            let synced = result?;
            Ok(WebhookOutcome::Synced {
                organization_id: synced.subscription.organization_id,
                status: synced.subscription.status,
            })
        }
        .instrument(span)
        .await
    }

    // =========================================================================
    // Checkout verification
    // =========================================================================

    /// Confirm a checkout by polling, then sync and report billing status.
    ///
    /// `cancel` lets the caller cut the confirmation short, e.g. when the
    /// client disconnects.
    pub async fn verify_payment(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> BillingResult<BillingStatus> {
        let span = tracing::info_span!("billing.verify_payment", session_id = %session_id);
        async move {
            let session = self
                .provider
                .confirm_checkout_session(session_id, cancel)
                .await?;

            let external_customer_id = session.external_customer_id.clone().ok_or_else(|| {
                BillingError::InvalidPayload(format!(
                    "checkout {} has no external customer id",
                    session.id
                ))
            })?;

            let synced = self.sync_external_customer(&external_customer_id).await?;
            let organization_id = synced.subscription.organization_id;
            let status = self.repository.get_quota_status(organization_id).await?;

            let billing_status = BillingStatus::from_quota_status(
                &status,
                Some(external_customer_id),
                OffsetDateTime::now_utc(),
            );
            tracing::info!(
                org_id = %organization_id,
                reason = %billing_status.reason,
                invoice_count = billing_status.invoice_count,
                "Payment verified"
            );
            Ok(billing_status)
        }
        .instrument(span)
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn quota_status(&self, organization_id: Uuid) -> BillingResult<QuotaStatus> {
        self.repository.get_quota_status(organization_id).await
    }

    /// Billing snapshot from local state only
    pub async fn billing_status(&self, organization_id: Uuid) -> BillingResult<BillingStatus> {
        let now = OffsetDateTime::now_utc();
        match self.repository.get_quota_status(organization_id).await {
            Ok(status) => Ok(BillingStatus::from_quota_status(&status, None, now)),
            Err(BillingError::SubscriptionNotFound) => {
                Ok(BillingStatus::no_subscription(organization_id, None, now))
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Consume one invoice credit and report it to the provider.
    ///
    /// The decrement is the hard gate. Usage reporting is best-effort and a
    /// failure leaves the decrement in place.
    pub async fn process_invoice(&self, organization_id: Uuid) -> BillingResult<InvoiceCharge> {
        let span = tracing::info_span!("billing.process_invoice", org_id = %organization_id);
        async move {
            let quota = match self.repository.decrement_invoice_count(organization_id).await {
                Ok(quota) => quota,
                Err(BillingError::QuotaExhausted) => {
                    tracing::info!("Invoice rejected, quota exhausted");
                    return Err(BillingError::QuotaExhausted);
                }
                Err(e) => return Err(e),
            };

            let usage_reported = match self.report_usage(organization_id).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        remaining = quota.invoice_count,
                        "Usage event not reported, local decrement kept"
                    );
                    false
                }
            };

            tracing::info!(remaining = quota.invoice_count, usage_reported, "Invoice charged");
            Ok(InvoiceCharge {
                quota,
                usage_reported,
            })
        }
        .instrument(span)
        .await
    }

    async fn report_usage(&self, organization_id: Uuid) -> BillingResult<()> {
        let external_customer_id = self
            .organizations
            .resolve_external_customer_id(organization_id)
            .await?;
        self.provider
            .ingest_usage_event(&external_customer_id, &self.meter_slug, 1)
            .await
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Refresh one organization from the provider
    pub async fn sync_organization(&self, organization_id: Uuid) -> BillingResult<SyncedSubscription> {
        let span = tracing::info_span!("billing.sync_organization", org_id = %organization_id);
        async move {
            let external_customer_id = self
                .organizations
                .resolve_external_customer_id(organization_id)
                .await?;
            self.sync(organization_id, &external_customer_id).await
        }
        .instrument(span)
        .await
    }

    /// Refresh every stored subscription; failures are collected, not fatal
    pub async fn resync_all(&self) -> BillingResult<Vec<ResyncResult>> {
        let subscriptions = self.repository.list_subscriptions().await?;
        tracing::info!(count = subscriptions.len(), "Starting subscription resync");

        let mut results = Vec::with_capacity(subscriptions.len());
        for stored in subscriptions {
            let organization_id = stored.organization_id;
            let span = tracing::info_span!("billing.resync", org_id = %organization_id);
            let result = self
                .sync(organization_id, &stored.external_customer_id)
                .instrument(span)
                .await;

            results.push(match result {
                Ok(synced) => ResyncResult::Synced {
                    organization_id,
                    status: synced.subscription.status,
                    invoice_count: synced.quota.invoice_count,
                },
                Err(e) if e.is_not_found() => ResyncResult::NotFound { organization_id },
                Err(e) => ResyncResult::Error {
                    organization_id,
                    error: e.to_string(),
                },
            });
        }

        Ok(results)
    }

    async fn sync_external_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<SyncedSubscription> {
        let organization_id = self
            .organizations
            .resolve_organization_id(external_customer_id)
            .await?;
        self.sync(organization_id, external_customer_id).await
    }

    /// fetch → upsert → reconcile
    async fn sync(
        &self,
        organization_id: Uuid,
        external_customer_id: &str,
    ) -> BillingResult<SyncedSubscription> {
        let mut fetched = self.provider.fetch_subscription(external_customer_id).await?;
        fetched.organization_id = organization_id;

        let subscription = self.repository.upsert_subscription(&fetched).await?;
        let quota = self
            .repository
            .reconcile_quota(
                organization_id,
                subscription.quota_ceiling(),
                subscription.max_seats(),
                subscription.current_period,
            )
            .await?;

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            invoice_count = quota.invoice_count,
            "Subscription synced"
        );

        Ok(SyncedSubscription {
            subscription,
            quota,
        })
    }

    // =========================================================================
    // Offboarding
    // =========================================================================

    /// Remove all billing state for an organization
    pub async fn offboard_organization(&self, organization_id: Uuid) -> BillingResult<()> {
        self.repository.delete_quota(organization_id).await?;
        self.repository.delete_subscription(organization_id).await?;
        tracing::info!(org_id = %organization_id, "Billing state removed");
        Ok(())
    }
}

#[async_trait]
impl StatusProvider for BillingService {
    async fn is_active_and_within_quota(&self, organization_id: Uuid) -> BillingResult<bool> {
        match self.repository.get_quota_status(organization_id).await {
            Ok(status) => Ok(status.can_process_invoice),
            Err(BillingError::SubscriptionNotFound) => Ok(false),
            Err(e) => {
                tracing::warn!(org_id = %organization_id, error = %e, "Quota status unavailable");
                Err(e)
            }
        }
    }
}
