pub mod database;
pub mod limits;
pub mod memory;
pub mod metrics;
pub mod provider;
pub mod reporter;
pub mod store;
pub mod stripe;
pub mod subscriptions;
pub mod tracker;

pub use database::Database;
pub use limits::{LimitCheck, LimitEnforcer};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use provider::{BillingProvider, ProviderError};
pub use reporter::{ReportSummary, UsageReporter};
pub use store::{SubscriptionStore, UsageStore};
pub use stripe::StripeProvider;
pub use subscriptions::SubscriptionService;
pub use tracker::{FlushReport, TrackerError, UsageTracker};
