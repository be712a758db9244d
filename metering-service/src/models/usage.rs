//! Usage metering models.

use crate::models::subscription::Subscription;
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Countable resource subject to plan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    TestRuns,
    AiTokens,
    SandboxMinutes,
}

impl UsageMetric {
    pub const ALL: [UsageMetric; 3] = [
        UsageMetric::TestRuns,
        UsageMetric::AiTokens,
        UsageMetric::SandboxMinutes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::TestRuns => "test_runs",
            UsageMetric::AiTokens => "ai_tokens",
            UsageMetric::SandboxMinutes => "sandbox_minutes",
        }
    }

    /// Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test_runs" => Some(UsageMetric::TestRuns),
            "ai_tokens" => Some(UsageMetric::AiTokens),
            "sandbox_minutes" => Some(UsageMetric::SandboxMinutes),
            _ => None,
        }
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buffer key: one accumulator per tenant and metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub tenant_id: Uuid,
    pub metric: UsageMetric,
}

impl UsageKey {
    pub fn new(tenant_id: Uuid, metric: UsageMetric) -> Self {
        Self { tenant_id, metric }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.metric)
    }
}

/// Half-open billing window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// The UTC calendar month containing `at`.
    pub fn calendar_month(at: DateTime<Utc>) -> Self {
        let start = Utc
            .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(at);
        let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
        Self { start, end }
    }

    /// The subscription's current period when `at` lies inside it, else the
    /// calendar month.
    pub fn resolve(subscription: Option<&Subscription>, at: DateTime<Utc>) -> Self {
        subscription
            .and_then(Subscription::current_period)
            .filter(|period| period.contains(at))
            .unwrap_or_else(|| Self::calendar_month(at))
    }
}

/// Durable usage row written by a flush.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub metric: String,
    pub quantity: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub reported_to_provider: bool,
    pub provider_usage_id: Option<String>,
    pub reported_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a flush insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUsageRecord {
    pub tenant_id: Uuid,
    pub metric: UsageMetric,
    pub quantity: i64,
    pub period: BillingPeriod,
}

/// Unreported rows grouped by tenant, metric and period.
#[derive(Debug, Clone, FromRow)]
pub struct UnreportedUsage {
    pub tenant_id: Uuid,
    pub metric: String,
    pub quantity: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub record_ids: Vec<Uuid>,
}

/// Period totals for every metric, zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub period: BillingPeriod,
    pub test_runs: i64,
    pub ai_tokens: i64,
    pub sandbox_minutes: i64,
}

impl UsageTotals {
    pub fn empty(period: BillingPeriod) -> Self {
        Self {
            period,
            test_runs: 0,
            ai_tokens: 0,
            sandbox_minutes: 0,
        }
    }

    pub fn get(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::TestRuns => self.test_runs,
            UsageMetric::AiTokens => self.ai_tokens,
            UsageMetric::SandboxMinutes => self.sandbox_minutes,
        }
    }

    pub fn set(&mut self, metric: UsageMetric, value: i64) {
        match metric {
            UsageMetric::TestRuns => self.test_runs = value,
            UsageMetric::AiTokens => self.ai_tokens = value,
            UsageMetric::SandboxMinutes => self.sandbox_minutes = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn metric_names_parse() {
        for metric in UsageMetric::ALL {
            assert_eq!(UsageMetric::parse(metric.as_str()), Some(metric));
        }
        assert_eq!(UsageMetric::parse("gpu_hours"), None);
        assert_eq!(
            serde_json::to_string(&UsageMetric::SandboxMinutes).unwrap(),
            "\"sandbox_minutes\""
        );
    }

    #[test]
    fn key_formats_as_tenant_and_metric() {
        let tenant = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let key = UsageKey::new(tenant, UsageMetric::AiTokens);
        assert_eq!(
            key.to_string(),
            "11111111-1111-1111-1111-111111111111:ai_tokens"
        );
    }

    #[test]
    fn calendar_month_wraps_december() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let period = BillingPeriod::calendar_month(at);
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(period.contains(at));
        assert!(!period.contains(period.end));
    }

    #[test]
    fn resolve_prefers_subscription_period() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let mut sub = Subscription::free_tier(Uuid::new_v4(), now - Duration::days(5));

        let period = BillingPeriod::resolve(Some(&sub), now);
        assert_eq!(period.start, now - Duration::days(5));

        // Expired subscription period falls back to the calendar month.
        sub.current_period_end = Some(now - Duration::days(1));
        let period = BillingPeriod::resolve(Some(&sub), now);
        assert_eq!(period, BillingPeriod::calendar_month(now));

        assert_eq!(
            BillingPeriod::resolve(None, now),
            BillingPeriod::calendar_month(now)
        );
    }
}
