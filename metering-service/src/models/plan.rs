//! Plan catalog: limits, features and pricing per tier.

use crate::models::usage::UsageMetric;
use serde::{Deserialize, Serialize};

/// Sentinel limit meaning "no cap".
pub const UNLIMITED: i64 = -1;

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Free, Plan::Pro, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "enterprise" => Some(Plan::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-period caps; [`UNLIMITED`] disables a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub test_runs: i64,
    pub ai_tokens: i64,
    pub sandbox_minutes: i64,
}

impl PlanLimits {
    pub fn for_metric(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::TestRuns => self.test_runs,
            UsageMetric::AiTokens => self.ai_tokens,
            UsageMetric::SandboxMinutes => self.sandbox_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub plan: Plan,
    pub provider_price_id: Option<String>,
    pub monthly_price_cents: i64,
    pub limits: PlanLimits,
    pub features: Vec<String>,
    pub trial_days: u32,
}

impl PlanConfig {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Provider price ids bound to the paid tiers.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub pro: Option<String>,
    pub enterprise: Option<String>,
}

/// Static plan table, built once at startup.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    free: PlanConfig,
    pro: PlanConfig,
    enterprise: PlanConfig,
}

fn features(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl PlanCatalog {
    pub fn new(prices: PriceIds) -> Self {
        let non_empty = |id: Option<String>| id.filter(|s| !s.is_empty());

        Self {
            free: PlanConfig {
                plan: Plan::Free,
                provider_price_id: None,
                monthly_price_cents: 0,
                limits: PlanLimits {
                    test_runs: 50,
                    ai_tokens: 10_000,
                    sandbox_minutes: 60,
                },
                features: features(&["basic_reports", "email_support"]),
                trial_days: 0,
            },
            pro: PlanConfig {
                plan: Plan::Pro,
                provider_price_id: non_empty(prices.pro),
                monthly_price_cents: 9_900,
                limits: PlanLimits {
                    test_runs: 500,
                    ai_tokens: 100_000,
                    sandbox_minutes: 600,
                },
                features: features(&[
                    "basic_reports",
                    "self_healing",
                    "visual_ai",
                    "priority_support",
                ]),
                trial_days: 14,
            },
            // Custom pricing, negotiated per contract.
            enterprise: PlanConfig {
                plan: Plan::Enterprise,
                provider_price_id: non_empty(prices.enterprise),
                monthly_price_cents: 0,
                limits: PlanLimits {
                    test_runs: UNLIMITED,
                    ai_tokens: UNLIMITED,
                    sandbox_minutes: UNLIMITED,
                },
                features: features(&[
                    "basic_reports",
                    "self_healing",
                    "visual_ai",
                    "sso",
                    "audit_log",
                    "dedicated_support",
                    "sla",
                ]),
                trial_days: 30,
            },
        }
    }

    pub fn get(&self, plan: Plan) -> &PlanConfig {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Enterprise => &self.enterprise,
        }
    }

    /// Look up a plan by its stored name.
    pub fn lookup(&self, name: &str) -> Option<&PlanConfig> {
        Plan::parse(name).map(|plan| self.get(plan))
    }

    /// Like [`lookup`](Self::lookup), but unknown names resolve to the free tier.
    pub fn resolve(&self, name: &str) -> &PlanConfig {
        self.lookup(name).unwrap_or(&self.free)
    }

    /// Reverse lookup from a provider price id.
    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        Plan::ALL.into_iter().find(|plan| {
            self.get(*plan).provider_price_id.as_deref() == Some(price_id)
        })
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(PriceIds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(PriceIds {
            pro: Some("price_pro".into()),
            enterprise: Some("price_ent".into()),
        })
    }

    #[test]
    fn default_limits_match_tiers() {
        let catalog = catalog();

        let free = catalog.get(Plan::Free);
        assert_eq!(free.limits.for_metric(UsageMetric::TestRuns), 50);
        assert_eq!(free.limits.for_metric(UsageMetric::AiTokens), 10_000);
        assert_eq!(free.limits.for_metric(UsageMetric::SandboxMinutes), 60);
        assert_eq!(free.trial_days, 0);

        let pro = catalog.get(Plan::Pro);
        assert_eq!(pro.monthly_price_cents, 9_900);
        assert_eq!(pro.limits.test_runs, 500);
        assert_eq!(pro.trial_days, 14);

        let enterprise = catalog.get(Plan::Enterprise);
        assert_eq!(enterprise.limits.ai_tokens, UNLIMITED);
        assert_eq!(enterprise.trial_days, 30);
        assert!(enterprise.has_feature("sso"));
        assert!(!catalog.get(Plan::Free).has_feature("sso"));
    }

    #[test]
    fn unknown_plan_resolves_to_free() {
        let catalog = catalog();
        assert!(catalog.lookup("platinum").is_none());
        assert_eq!(catalog.resolve("platinum").plan, Plan::Free);
        assert_eq!(catalog.resolve("pro").plan, Plan::Pro);
    }

    #[test]
    fn reverse_lookup_by_price() {
        let catalog = catalog();
        assert_eq!(catalog.plan_for_price("price_pro"), Some(Plan::Pro));
        assert_eq!(catalog.plan_for_price("price_ent"), Some(Plan::Enterprise));
        assert_eq!(catalog.plan_for_price("price_other"), None);
    }

    #[test]
    fn blank_price_ids_are_unset() {
        let catalog = PlanCatalog::new(PriceIds {
            pro: Some(String::new()),
            enterprise: None,
        });
        assert!(catalog.get(Plan::Pro).provider_price_id.is_none());
        assert_eq!(catalog.plan_for_price(""), None);
    }
}
