//! In-memory store for tests and local development.

use crate::models::{
    NewUsageRecord, Subscription, SubscriptionSnapshot, SyncOutcome,
    UnreportedUsage, UsageMetric, UsageRecord,
};
use crate::services::store::{SubscriptionStore, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryStore {
    usage: RwLock<Vec<UsageRecord>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    fail_usage_writes: AtomicBool,
    usage_write_delay_ms: AtomicU64,
    usage_batches: AtomicUsize,
}

fn poisoned() -> AppError {
    AppError::InternalError(anyhow::anyhow!("in-memory store lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `insert_usage` calls fail until switched back.
    pub fn fail_usage_writes(&self, fail: bool) {
        self.fail_usage_writes.store(fail, Ordering::SeqCst);
    }

    /// Stall each `insert_usage` call for `delay` before it writes.
    pub fn delay_usage_writes(&self, delay: Duration) {
        self.usage_write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful `insert_usage` batches.
    pub fn usage_batches(&self) -> usize {
        self.usage_batches.load(Ordering::SeqCst)
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Seed or replace a subscription row.
    pub fn put_subscription(&self, subscription: Subscription) -> Result<(), AppError> {
        self.subs_write()?
            .insert(subscription.tenant_id, subscription);
        Ok(())
    }

    fn usage_read(&self) -> Result<RwLockReadGuard<'_, Vec<UsageRecord>>, AppError> {
        self.usage.read().map_err(|_| poisoned())
    }

    fn usage_write(&self) -> Result<RwLockWriteGuard<'_, Vec<UsageRecord>>, AppError> {
        self.usage.write().map_err(|_| poisoned())
    }

    fn subs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, Subscription>>, AppError> {
        self.subscriptions.read().map_err(|_| poisoned())
    }

    fn subs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, Subscription>>, AppError> {
        self.subscriptions.write().map_err(|_| poisoned())
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn insert_usage(&self, records: &[NewUsageRecord]) -> Result<u64, AppError> {
        let delay = self.usage_write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_usage_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "usage writes are disabled"
            )));
        }

        let now = Utc::now();
        let mut usage = self.usage_write()?;
        usage.extend(records.iter().map(|r| UsageRecord {
            id: Uuid::new_v4(),
            tenant_id: r.tenant_id,
            metric: r.metric.as_str().to_string(),
            quantity: r.quantity,
            period_start: r.period.start,
            period_end: r.period.end,
            reported_to_provider: false,
            provider_usage_id: None,
            reported_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }));
        self.usage_batches.fetch_add(1, Ordering::SeqCst);

        Ok(records.len() as u64)
    }

    async fn period_usage(
        &self,
        tenant_id: Uuid,
        metric: UsageMetric,
        at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let usage = self.usage_read()?;
        Ok(usage
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.metric == metric.as_str()
                    && r.period_start <= at
                    && at < r.period_end
            })
            .fold(0i64, |acc, r| acc.saturating_add(r.quantity)))
    }

    async fn unreported_usage(&self) -> Result<Vec<UnreportedUsage>, AppError> {
        let usage = self.usage_read()?;
        let mut groups: BTreeMap<_, UnreportedUsage> = BTreeMap::new();

        for r in usage.iter().filter(|r| !r.reported_to_provider) {
            let key = (r.tenant_id, r.metric.clone(), r.period_start, r.period_end);
            let group = groups.entry(key).or_insert_with(|| UnreportedUsage {
                tenant_id: r.tenant_id,
                metric: r.metric.clone(),
                quantity: 0,
                period_start: r.period_start,
                period_end: r.period_end,
                record_ids: Vec::new(),
            });
            group.quantity = group.quantity.saturating_add(r.quantity);
            group.record_ids.push(r.id);
        }

        Ok(groups.into_values().collect())
    }

    async fn mark_reported(
        &self,
        record_ids: &[Uuid],
        provider_usage_id: Option<&str>,
    ) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut usage = self.usage_write()?;
        let mut updated = 0;

        for r in usage
            .iter_mut()
            .filter(|r| !r.reported_to_provider && record_ids.contains(&r.id))
        {
            r.reported_to_provider = true;
            r.provider_usage_id = provider_usage_id.map(str::to_owned);
            r.reported_at = Some(now);
            r.updated_at = now;
            updated += 1;
        }

        Ok(updated)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.usage_read().map(|_| ())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<Subscription>, AppError> {
        Ok(self.subs_read()?.get(&tenant_id).cloned())
    }

    async fn find_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .subs_read()?
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_subscription_id))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let mut subs = self.subs_write()?;
        Ok(subs
            .entry(subscription.tenant_id)
            .or_insert_with(|| subscription.clone())
            .clone())
    }

    async fn set_provider_customer(
        &self,
        tenant_id: Uuid,
        provider_customer_id: &str,
    ) -> Result<Subscription, AppError> {
        let mut subs = self.subs_write()?;
        let sub = subs
            .get_mut(&tenant_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
        sub.provider_customer_id = Some(provider_customer_id.to_string());
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

    async fn apply_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<Subscription, AppError> {
        let mut subs = self.subs_write()?;
        let sub = subs
            .get_mut(&tenant_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
        snapshot.apply_to(sub, Utc::now());
        Ok(sub.clone())
    }

    async fn sync_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<SyncOutcome, AppError> {
        let mut subs = self.subs_write()?;
        let Some(sub) = subs.values_mut().find(|s| {
            s.provider_subscription_id.as_deref() == Some(snapshot.provider_subscription_id.as_str())
        }) else {
            return Ok(SyncOutcome::NotFound);
        };

        if snapshot.apply_to(sub, Utc::now()) {
            Ok(SyncOutcome::Updated)
        } else {
            Ok(SyncOutcome::Unchanged)
        }
    }

    async fn mark_canceled(&self, tenant_id: Uuid) -> Result<Subscription, AppError> {
        let now = Utc::now();
        let mut subs = self.subs_write()?;
        let sub = subs
            .get_mut(&tenant_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
        sub.status = "canceled".to_string();
        sub.canceled_at = Some(now);
        sub.updated_at = now;
        Ok(sub.clone())
    }
}
