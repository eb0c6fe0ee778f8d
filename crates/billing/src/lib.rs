// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::ProviderUnavailable carries the response body
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! QuotaSync Billing
//!
//! Keeps a local projection of subscription and invoice-quota state in line
//! with an external payment provider.
//!
//! ## Features
//!
//! - **Webhooks**: Standard Webhooks signature verification, delivery ledger, event parsing
//! - **Checkout Confirmation**: Bounded, cancellable polling right after checkout
//! - **Quota Tracking**: Atomic per-invoice decrement, period-aware reconciliation on sync
//! - **Status Gate**: `StatusProvider` answered from local state only
//! - **Usage Reporting**: Best-effort meter events per processed invoice
//! - **Resync**: Full refresh of every stored subscription, run by the worker

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod organizations;
pub mod provider;
pub mod repository;
pub mod service;
pub mod signature;
pub mod webhooks;


// Client
pub use client::{HttpProviderClient, ProviderClient, ProviderResponse};

// Config
pub use config::{BillingConfig, CheckoutPolling};

// Error
pub use error::{BillingError, BillingResult, SignatureError};

// Models
pub use models::{
    BillingPeriod, BillingStatus, BillingStatusReason, CheckoutSessionResponse, QuotaStatus,
    QuotaTracking, Subscription,
};

// Organizations
pub use organizations::{InMemoryOrganizationAdapter, OrganizationAdapter, PgOrganizationAdapter};

// Provider
pub use provider::{BillingProvider, ProviderAdapter};

// Repository
pub use repository::{
    run_migrations, InMemorySubscriptionRepository, PgSubscriptionRepository,
    SubscriptionRepository,
};

// Service
pub use service::{BillingService, InvoiceCharge, ResyncResult, StatusProvider, SyncedSubscription};

// Signature
pub use signature::SignatureVerifier;

// Webhooks
pub use webhooks::{WebhookOutcome, WebhookRequest};

// Re-exported for callers wiring cancellation into `verify_payment`
pub use tokio_util::sync::CancellationToken;
