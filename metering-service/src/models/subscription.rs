//! Subscription model.

use crate::models::plan::{Plan, PlanCatalog, PlanConfig};
use crate::models::usage::BillingPeriod;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status as reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

/// One row per tenant. `status` and `plan` are stored verbatim so that
/// provider values this service does not model survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub plan: String,
    pub status: String,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub default_payment_method_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Free-tier row with a one-month period starting at `now`.
    pub fn free_tier(tenant_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            provider_customer_id: None,
            provider_subscription_id: None,
            provider_price_id: None,
            plan: Plan::Free.as_str().to_string(),
            status: SubscriptionStatus::Active.as_str().to_string(),
            billing_cycle_anchor: Some(now),
            current_period_start: Some(now),
            current_period_end: now.checked_add_months(Months::new(1)),
            trial_start: None,
            trial_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            default_payment_method_id: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status().is_some_and(|s| s.is_active())
    }

    pub fn is_trial(&self) -> bool {
        self.status() == Some(SubscriptionStatus::Trialing)
    }

    pub fn plan_config<'a>(&self, catalog: &'a PlanCatalog) -> &'a PlanConfig {
        catalog.resolve(&self.plan)
    }

    pub fn current_period(&self) -> Option<BillingPeriod> {
        match (self.current_period_start, self.current_period_end) {
            (Some(start), Some(end)) if start < end => Some(BillingPeriod { start, end }),
            _ => None,
        }
    }
}

/// Provider-authoritative fields written on subscribe, cancel and sync.
///
/// `plan` and `provider_price_id` are written together, and only when `plan`
/// is set (the price mapped to a catalog plan).
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub provider_subscription_id: String,
    pub provider_price_id: Option<String>,
    pub plan: Option<Plan>,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub default_payment_method_id: Option<String>,
}

impl SubscriptionSnapshot {
    /// Copy the snapshot onto `subscription`. Returns whether any field changed;
    /// `updated_at` is bumped only in that case.
    pub fn apply_to(&self, subscription: &mut Subscription, now: DateTime<Utc>) -> bool {
        let before = subscription.clone();

        subscription.provider_subscription_id = Some(self.provider_subscription_id.clone());
        if let Some(plan) = self.plan {
            subscription.plan = plan.as_str().to_string();
            subscription.provider_price_id = self.provider_price_id.clone();
        }
        subscription.status = self.status.clone();
        subscription.current_period_start = self.current_period_start;
        subscription.current_period_end = self.current_period_end;
        subscription.trial_start = self.trial_start;
        subscription.trial_end = self.trial_end;
        subscription.cancel_at = self.cancel_at;
        subscription.canceled_at = self.canceled_at;
        subscription.cancel_at_period_end = self.cancel_at_period_end;
        subscription.default_payment_method_id = self.default_payment_method_id.clone();

        let changed = *subscription != before;
        if changed {
            subscription.updated_at = now;
        }
        changed
    }
}

/// Result of reconciling a row against a provider snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Updated,
    Unchanged,
    NotFound,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Updated => "updated",
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::NotFound => "not_found",
        }
    }
}
