//! Plan limit enforcement over durable plus still-buffered usage.

use crate::models::{UsageMetric, UNLIMITED};
use crate::services::metrics::record_limit_exceeded;
use crate::services::store::UsageStore;
use crate::services::subscriptions::SubscriptionService;
use crate::services::tracker::UsageTracker;
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub metric: String,
    pub exceeded: bool,
    pub limit: i64,
    pub current_usage: i64,
}

pub struct LimitEnforcer {
    subscriptions: Arc<SubscriptionService>,
    usage: Arc<dyn UsageStore>,
    tracker: Arc<UsageTracker>,
}

impl LimitEnforcer {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        usage: Arc<dyn UsageStore>,
        tracker: Arc<UsageTracker>,
    ) -> Self {
        Self {
            subscriptions,
            usage,
            tracker,
        }
    }

    /// Usage for the current period (durable sum plus the tracker's buffer)
    /// compared with the plan cap.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn check(&self, tenant_id: Uuid, metric: &str) -> Result<LimitCheck, AppError> {
        let Some(parsed) = UsageMetric::parse(metric) else {
            return Ok(LimitCheck {
                metric: metric.to_string(),
                exceeded: false,
                limit: UNLIMITED,
                current_usage: 0,
            });
        };

        let current_usage = self.current_usage(tenant_id, parsed).await?;
        let (exceeded, limit) = self
            .subscriptions
            .check_usage_limit(tenant_id, metric, current_usage)
            .await?;
        if exceeded {
            record_limit_exceeded(metric);
        }

        Ok(LimitCheck {
            metric: parsed.as_str().to_string(),
            exceeded,
            limit,
            current_usage,
        })
    }

    /// One [`LimitCheck`] per metric.
    pub async fn check_all(&self, tenant_id: Uuid) -> Result<Vec<LimitCheck>, AppError> {
        let mut checks = Vec::with_capacity(UsageMetric::ALL.len());
        for metric in UsageMetric::ALL {
            checks.push(self.check(tenant_id, metric.as_str()).await?);
        }
        Ok(checks)
    }

    async fn current_usage(&self, tenant_id: Uuid, metric: UsageMetric) -> Result<i64, AppError> {
        // Buffered first: a flush landing between the two reads is counted
        // twice rather than not at all.
        let buffered = self.tracker.pending(tenant_id, metric);
        let persisted = self.usage.period_usage(tenant_id, metric, Utc::now()).await?;
        Ok(persisted.saturating_add(buffered))
    }
}
