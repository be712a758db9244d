//! Domain models for metering-service.

mod plan;
mod subscription;
mod usage;

pub use plan::{Plan, PlanCatalog, PlanConfig, PlanLimits, PriceIds, UNLIMITED};
pub use subscription::{Subscription, SubscriptionSnapshot, SubscriptionStatus, SyncOutcome};
pub use usage::{
    BillingPeriod, NewUsageRecord, UnreportedUsage, UsageKey, UsageMetric,
    UsageRecord, UsageTotals,
};
