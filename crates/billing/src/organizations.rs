//! Organization lookups
//!
//! The organization directory is owned elsewhere; billing only needs to map
//! between internal organization IDs and the external customer ID the
//! provider knows them by.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait OrganizationAdapter: Send + Sync {
    /// External customer ID for an organization
    async fn resolve_external_customer_id(&self, organization_id: Uuid) -> BillingResult<String>;

    /// Organization that owns an external customer ID
    async fn resolve_organization_id(&self, external_customer_id: &str) -> BillingResult<Uuid>;
}

/// Reads `organizations.external_id`
#[derive(Clone)]
pub struct PgOrganizationAdapter {
    pool: PgPool,
}

impl PgOrganizationAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationAdapter for PgOrganizationAdapter {
    async fn resolve_external_customer_id(&self, organization_id: Uuid) -> BillingResult<String> {
        let external_id: Option<Option<String>> =
            sqlx::query_scalar("SELECT external_id FROM organizations WHERE id = $1")
                .bind(organization_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(format!("resolve external customer id: {}", e)))?;

        external_id
            .flatten()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BillingError::OrganizationNotFound(organization_id.to_string()))
    }

    async fn resolve_organization_id(&self, external_customer_id: &str) -> BillingResult<Uuid> {
        sqlx::query_scalar("SELECT id FROM organizations WHERE external_id = $1")
            .bind(external_customer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(format!("resolve organization id: {}", e)))?
            .ok_or_else(|| BillingError::OrganizationNotFound(external_customer_id.to_string()))
    }
}

/// In-process organization directory for tests and local runs
#[derive(Default)]
pub struct InMemoryOrganizationAdapter {
    by_id: RwLock<HashMap<Uuid, String>>,
}

impl InMemoryOrganizationAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn link(&self, organization_id: Uuid, external_customer_id: impl Into<String>) {
        self.by_id
            .write()
            .await
            .insert(organization_id, external_customer_id.into());
    }
}

#[async_trait]
impl OrganizationAdapter for InMemoryOrganizationAdapter {
    async fn resolve_external_customer_id(&self, organization_id: Uuid) -> BillingResult<String> {
        self.by_id
            .read()
            .await
            .get(&organization_id)
            .cloned()
            .ok_or_else(|| BillingError::OrganizationNotFound(organization_id.to_string()))
    }

    async fn resolve_organization_id(&self, external_customer_id: &str) -> BillingResult<Uuid> {
        self.by_id
            .read()
            .await
            .iter()
            .find(|(_, external)| external.as_str() == external_customer_id)
            .map(|(id, _)| *id)
            .ok_or_else(|| BillingError::OrganizationNotFound(external_customer_id.to_string()))
    }
}
