//! Pushes unreported usage to the provider's metered-billing ledger.
//!
//! Each unreported group (tenant, metric, period) becomes one `increment`
//! usage record on the subscription item whose price lookup key matches the
//! metric. The request carries an idempotency key derived from the row ids,
//! so a crash between the provider call and `mark_reported` cannot double bill.
//!
//! Groups that can never be billed are retired: marked reported without a
//! provider usage id. That covers metrics the provider subscription has no
//! metered item for, and closed periods of tenants without a provider
//! subscription.

use crate::models::UnreportedUsage;
use crate::services::metrics::{record_error, record_usage_report};
use crate::services::provider::{
    BillingProvider, NewUsageReport, ProviderSubscription, UsageAction,
};
use crate::services::store::{SubscriptionStore, UsageStore};
use chrono::Utc;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub reported: usize,
    pub skipped: usize,
    pub retired: usize,
    pub failed: usize,
}

pub struct UsageReporter {
    usage: Arc<dyn UsageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
}

enum GroupOutcome {
    Reported,
    Skipped(&'static str),
    Retired(&'static str),
}

fn idempotency_key(group: &UnreportedUsage) -> String {
    let mut ids = group.record_ids.clone();
    ids.sort();

    let mut hasher = Sha256::new();
    for id in &ids {
        hasher.update(id.as_bytes());
    }
    format!("usage-{}", hex::encode(hasher.finalize()))
}

impl UsageReporter {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            usage,
            subscriptions,
            provider,
        }
    }

    /// Report every unreported group once. A failing group is logged and left
    /// for the next pass; it does not stop the others.
    #[instrument(skip(self))]
    pub async fn report_once(&self) -> Result<ReportSummary, AppError> {
        let groups = self.usage.unreported_usage().await?;
        let mut summary = ReportSummary::default();
        // One provider lookup per subscription per pass.
        let mut remotes = HashMap::new();

        for group in &groups {
            match self.report_group(group, &mut remotes).await {
                Ok(GroupOutcome::Reported) => {
                    summary.reported += 1;
                    record_usage_report("reported");
                }
                Ok(GroupOutcome::Skipped(reason)) => {
                    summary.skipped += 1;
                    record_usage_report("skipped");
                    debug!(
                        tenant_id = %group.tenant_id,
                        metric = %group.metric,
                        reason,
                        "Usage group not reported"
                    );
                }
                Ok(GroupOutcome::Retired(reason)) => {
                    summary.retired += 1;
                    record_usage_report("retired");
                    debug!(
                        tenant_id = %group.tenant_id,
                        metric = %group.metric,
                        rows = group.record_ids.len(),
                        reason,
                        "Usage group retired as not billable"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    record_usage_report("failed");
                    record_error("usage_report", &group.metric);
                    warn!(
                        tenant_id = %group.tenant_id,
                        metric = %group.metric,
                        error = %e,
                        "Failed to report usage group"
                    );
                }
            }
        }

        if !groups.is_empty() {
            info!(
                reported = summary.reported,
                skipped = summary.skipped,
                retired = summary.retired,
                failed = summary.failed,
                "Usage report pass finished"
            );
        }
        Ok(summary)
    }

    async fn report_group(
        &self,
        group: &UnreportedUsage,
        remotes: &mut HashMap<String, ProviderSubscription>,
    ) -> Result<GroupOutcome, AppError> {
        let provider_subscription_id = self
            .subscriptions
            .find_by_tenant(group.tenant_id)
            .await?
            .and_then(|subscription| subscription.provider_subscription_id);
        let Some(provider_subscription_id) = provider_subscription_id else {
            // The tenant may still subscribe before the period closes.
            if group.period_end <= Utc::now() {
                return self.retire(group, "period closed without provider subscription").await;
            }
            return Ok(GroupOutcome::Skipped("no provider subscription"));
        };

        let remote = match remotes.entry(provider_subscription_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let fetched = self.provider.get_subscription(entry.key()).await?;
                entry.insert(fetched)
            }
        };
        let Some(item) = remote.item_for_metric(&group.metric) else {
            return self.retire(group, "no metered item for metric").await;
        };

        let record = self
            .provider
            .create_usage_record(&NewUsageReport {
                subscription_item_id: item.id.clone(),
                quantity: group.quantity,
                timestamp: Utc::now().timestamp(),
                action: UsageAction::Increment,
                idempotency_key: Some(idempotency_key(group)),
            })
            .await?;

        self.usage
            .mark_reported(&group.record_ids, Some(&record.id))
            .await?;
        Ok(GroupOutcome::Reported)
    }

    async fn retire(
        &self,
        group: &UnreportedUsage,
        reason: &'static str,
    ) -> Result<GroupOutcome, AppError> {
        self.usage.mark_reported(&group.record_ids, None).await?;
        Ok(GroupOutcome::Retired(reason))
    }

    /// Run [`report_once`](Self::report_once) every `interval` until cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.report_once().await {
                            warn!(error = %e, "Usage report pass failed");
                        }
                    }
                }
            }
            debug!("Usage reporter stopped");
        })
    }
}
