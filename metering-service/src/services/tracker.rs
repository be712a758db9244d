//! Usage tracker: lock-light accumulation on the request path, batched writes
//! from a single background task.
//!
//! `track` only takes the buffer's write lock for an insert and never awaits.
//! A flush moves the live map into an in-flight slot under that lock and
//! performs storage I/O after releasing it. Reads count both maps until the
//! write lands. A failed or abandoned write merges the snapshot back, so usage
//! is delivered at least once.

use crate::config::TrackerConfig;
use crate::models::{BillingPeriod, NewUsageRecord, UsageKey, UsageMetric, UsageTotals};
use crate::services::metrics::{
    record_flush, record_records_flushed, record_usage_tracked, set_buffered_keys,
};
use crate::services::store::{SubscriptionStore, UsageStore};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("usage tracker is closed")]
    Closed,

    #[error("usage flush failed: {0}")]
    Store(#[from] AppError),

    #[error("final flush failed with {entries} entries still buffered: {source}")]
    FinalFlush {
        entries: usize,
        #[source]
        source: AppError,
    },

    #[error("final flush timed out after {timeout_secs}s with {entries} entries ({quantity} units) unflushed")]
    FlushTimeout {
        timeout_secs: u64,
        entries: usize,
        quantity: i64,
    },
}

impl From<TrackerError> for AppError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Closed => AppError::ServiceUnavailable,
            TrackerError::Store(e) => e,
            e @ (TrackerError::FinalFlush { .. } | TrackerError::FlushTimeout { .. }) => {
                AppError::InternalError(anyhow::anyhow!("{}", e))
            }
        }
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub records: usize,
    pub quantity: i64,
}

type Buffer = HashMap<UsageKey, i64>;

#[derive(Default)]
struct Buffers {
    live: Buffer,
    /// Snapshot owned by the flush that is currently writing.
    inflight: Buffer,
    closed: bool,
}

impl Buffers {
    fn quantity(&self, key: &UsageKey) -> i64 {
        let live = self.live.get(key).copied().unwrap_or(0);
        let inflight = self.inflight.get(key).copied().unwrap_or(0);
        live.saturating_add(inflight)
    }

    fn unflushed_keys(&self) -> usize {
        self.live.len()
            + self
                .inflight
                .keys()
                .filter(|key| !self.live.contains_key(key))
                .count()
    }

    /// Move the in-flight snapshot back into the live map.
    fn requeue_inflight(&mut self) {
        for (key, quantity) in std::mem::take(&mut self.inflight) {
            let slot = self.live.entry(key).or_insert(0);
            *slot = slot.saturating_add(quantity);
        }
    }
}

struct TrackerInner {
    buffers: RwLock<Buffers>,
    flush_threshold: usize,
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    usage_store: Arc<dyn UsageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

pub struct UsageTracker {
    inner: Arc<TrackerInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UsageTracker {
    /// Create the tracker and start its flush scheduler on the current runtime.
    pub fn spawn(
        config: &TrackerConfig,
        usage_store: Arc<dyn UsageStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        let inner = Arc::new(TrackerInner {
            buffers: RwLock::new(Buffers::default()),
            flush_threshold: config.flush_threshold.max(1),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
            usage_store,
            subscriptions,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_scheduler(
            inner.clone(),
            config.flush_interval,
            cancel.clone(),
        ));

        info!(
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            flush_threshold = config.flush_threshold,
            "Usage tracker started"
        );

        Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Accumulate `quantity` for the tenant and metric. Never blocks on I/O.
    pub fn track(
        &self,
        tenant_id: Uuid,
        metric: UsageMetric,
        quantity: u64,
    ) -> Result<(), TrackerError> {
        let quantity = i64::try_from(quantity).unwrap_or(i64::MAX);

        let keys = {
            // `closed` is read under the same lock `close` sets it with, so
            // nothing lands after the final snapshot.
            let mut buffers = self.inner.write_buffers();
            if buffers.closed {
                return Err(TrackerError::Closed);
            }
            if quantity == 0 {
                return Ok(());
            }
            let slot = buffers
                .live
                .entry(UsageKey::new(tenant_id, metric))
                .or_insert(0);
            *slot = slot.saturating_add(quantity);
            buffers.live.len()
        };

        record_usage_tracked(metric.as_str(), quantity);
        set_buffered_keys(keys);
        if keys > self.inner.flush_threshold {
            self.inner.flush_requested.notify_one();
        }

        Ok(())
    }

    pub fn track_test_run(&self, tenant_id: Uuid) -> Result<(), TrackerError> {
        self.track(tenant_id, UsageMetric::TestRuns, 1)
    }

    pub fn track_ai_tokens(&self, tenant_id: Uuid, tokens: u64) -> Result<(), TrackerError> {
        self.track(tenant_id, UsageMetric::AiTokens, tokens)
    }

    pub fn track_sandbox_minutes(&self, tenant_id: Uuid, minutes: u64) -> Result<(), TrackerError> {
        self.track(tenant_id, UsageMetric::SandboxMinutes, minutes)
    }

    /// Write everything buffered so far.
    pub async fn flush(&self) -> Result<FlushReport, TrackerError> {
        self.inner.flush("manual").await
    }

    /// Stop the scheduler, wait for it, then flush what is left.
    pub async fn close(&self) -> Result<FlushReport, TrackerError> {
        {
            let mut buffers = self.inner.write_buffers();
            if buffers.closed {
                return Err(TrackerError::Closed);
            }
            buffers.closed = true;
        }

        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Usage flush scheduler panicked");
            }
        }

        match self.inner.flush("shutdown").await {
            Ok(report) => {
                info!(
                    records = report.records,
                    quantity = report.quantity,
                    "Usage tracker closed"
                );
                Ok(report)
            }
            Err(TrackerError::Store(source)) => Err(TrackerError::FinalFlush {
                entries: self.buffered_keys(),
                source,
            }),
            Err(other) => Err(other),
        }
    }

    /// [`close`](Self::close) bounded by `timeout`. When the final write does
    /// not finish in time its snapshot stays buffered and the error reports
    /// how much usage was left behind.
    pub async fn close_within(&self, timeout: Duration) -> Result<FlushReport, TrackerError> {
        match tokio::time::timeout(timeout, self.close()).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::FlushTimeout {
                timeout_secs: timeout.as_secs(),
                entries: self.buffered_keys(),
                quantity: self.unflushed_quantity(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read_buffers(|buffers| buffers.closed)
    }

    /// Distinct keys not yet durable, including a snapshot being written.
    pub fn buffered_keys(&self) -> usize {
        self.inner.read_buffers(Buffers::unflushed_keys)
    }

    fn unflushed_quantity(&self) -> i64 {
        self.inner.read_buffers(|buffers| {
            buffers
                .live
                .values()
                .chain(buffers.inflight.values())
                .fold(0i64, |acc, q| acc.saturating_add(*q))
        })
    }

    /// Quantity for one key that is not yet durable.
    pub fn pending(&self, tenant_id: Uuid, metric: UsageMetric) -> i64 {
        self.inner
            .read_buffers(|buffers| buffers.quantity(&UsageKey::new(tenant_id, metric)))
    }

    pub fn pending_for_tenant(&self, tenant_id: Uuid) -> HashMap<UsageMetric, i64> {
        self.inner.read_buffers(|buffers| {
            let mut pending = HashMap::new();
            for (key, quantity) in buffers.live.iter().chain(buffers.inflight.iter()) {
                if key.tenant_id == tenant_id {
                    let slot = pending.entry(key.metric).or_insert(0i64);
                    *slot = slot.saturating_add(*quantity);
                }
            }
            pending
        })
    }

    /// Flush, then return durable totals for the tenant's current period.
    pub async fn current_usage(&self, tenant_id: Uuid) -> Result<UsageTotals, AppError> {
        self.flush().await?;

        let now = Utc::now();
        let period = self.inner.resolve_period(tenant_id, now).await;
        let mut totals = UsageTotals::empty(period);
        for metric in UsageMetric::ALL {
            let used = self
                .inner
                .usage_store
                .period_usage(tenant_id, metric, now)
                .await?;
            totals.set(metric, used);
        }
        Ok(totals)
    }
}

impl TrackerInner {
    fn write_buffers(&self) -> std::sync::RwLockWriteGuard<'_, Buffers> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.buffers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_buffers<T>(&self, f: impl FnOnce(&Buffers) -> T) -> T {
        let guard = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    async fn resolve_period(&self, tenant_id: Uuid, at: DateTime<Utc>) -> BillingPeriod {
        match self.subscriptions.find_by_tenant(tenant_id).await {
            Ok(subscription) => BillingPeriod::resolve(subscription.as_ref(), at),
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Subscription lookup failed, using calendar month");
                BillingPeriod::calendar_month(at)
            }
        }
    }

    async fn flush(&self, trigger: &str) -> Result<FlushReport, TrackerError> {
        let _guard = self.flush_lock.lock().await;

        let snapshot: Vec<(UsageKey, i64)> = {
            let mut buffers = self.write_buffers();
            // Left over when an earlier flush was dropped mid-write.
            buffers.requeue_inflight();
            buffers.inflight = std::mem::take(&mut buffers.live);
            buffers.inflight.iter().map(|(k, q)| (*k, *q)).collect()
        };
        set_buffered_keys(self.read_buffers(|b| b.live.len()));
        if snapshot.is_empty() {
            return Ok(FlushReport::default());
        }

        let now = Utc::now();
        let mut periods: HashMap<Uuid, BillingPeriod> = HashMap::new();
        let mut records = Vec::with_capacity(snapshot.len());
        for (key, quantity) in &snapshot {
            let period = match periods.get(&key.tenant_id).copied() {
                Some(period) => period,
                None => {
                    let period = self.resolve_period(key.tenant_id, now).await;
                    periods.insert(key.tenant_id, period);
                    period
                }
            };
            records.push(NewUsageRecord {
                tenant_id: key.tenant_id,
                metric: key.metric,
                quantity: *quantity,
                period,
            });
        }

        match self.usage_store.insert_usage(&records).await {
            Ok(written) => {
                self.write_buffers().inflight.clear();
                let report = FlushReport {
                    records: records.len(),
                    quantity: records
                        .iter()
                        .fold(0i64, |acc, r| acc.saturating_add(r.quantity)),
                };
                for record in &records {
                    record_records_flushed(record.metric.as_str(), 1);
                }
                record_flush(trigger, "success");
                debug!(
                    trigger,
                    records = report.records,
                    written,
                    "Usage buffer flushed"
                );
                Ok(report)
            }
            Err(e) => {
                self.restore();
                record_flush(trigger, "failure");
                warn!(trigger, error = %e, "Usage flush failed, entries returned to buffer");
                Err(TrackerError::Store(e))
            }
        }
    }

    fn restore(&self) {
        let keys = {
            let mut buffers = self.write_buffers();
            buffers.requeue_inflight();
            buffers.live.len()
        };
        set_buffered_keys(keys);
    }
}

async fn run_scheduler(
    inner: Arc<TrackerInner>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    'scheduler: loop {
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "interval",
            _ = inner.flush_requested.notified() => "threshold",
        };

        // Failures are logged inside flush. Retries wait for the timer so a
        // down store cannot turn threshold wakeups into a busy loop.
        let mut result = inner.flush(trigger).await;
        while result.is_err() {
            tokio::select! {
                _ = cancel.cancelled() => break 'scheduler,
                _ = ticker.tick() => {}
            }
            result = inner.flush("retry").await;
        }
    }

    debug!("Usage flush scheduler stopped");
}
