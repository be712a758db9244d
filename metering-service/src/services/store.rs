//! Storage seams for usage records and subscriptions.
//!
//! [`Database`](super::Database) is the PostgreSQL implementation;
//! [`InMemoryStore`](super::InMemoryStore) backs tests and local runs.

use crate::models::{
    NewUsageRecord, Subscription, SubscriptionSnapshot, SyncOutcome,
    UnreportedUsage, UsageMetric,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert one flush window atomically. Returns the number of rows written.
    async fn insert_usage(&self, records: &[NewUsageRecord]) -> Result<u64, AppError>;

    /// Sum of durable usage for a tenant and metric over every row whose
    /// stamped billing period contains `at`.
    async fn period_usage(
        &self,
        tenant_id: Uuid,
        metric: UsageMetric,
        at: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Unreported rows grouped by tenant, metric and period.
    async fn unreported_usage(&self) -> Result<Vec<UnreportedUsage>, AppError>;

    /// Flag exactly `record_ids` as reported. Rows already flagged are left alone.
    async fn mark_reported(
        &self,
        record_ids: &[Uuid],
        provider_usage_id: Option<&str>,
    ) -> Result<u64, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<Subscription>, AppError>;

    async fn find_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Insert unless a row for the tenant already exists, then return the stored row.
    async fn insert_if_absent(&self, subscription: &Subscription)
        -> Result<Subscription, AppError>;

    async fn set_provider_customer(
        &self,
        tenant_id: Uuid,
        provider_customer_id: &str,
    ) -> Result<Subscription, AppError>;

    /// Overwrite provider-owned fields on the tenant's row.
    async fn apply_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<Subscription, AppError>;

    /// Overwrite provider-owned fields on the row linked to the snapshot's
    /// subscription id, touching it only when something differs.
    async fn sync_snapshot(&self, snapshot: &SubscriptionSnapshot)
        -> Result<SyncOutcome, AppError>;

    /// Local cancellation for rows with no provider subscription.
    async fn mark_canceled(&self, tenant_id: Uuid) -> Result<Subscription, AppError>;
}
