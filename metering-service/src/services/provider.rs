//! Billing provider seam.
//!
//! The provider is the authoritative ledger for customers, subscriptions and
//! metered usage. [`StripeProvider`](super::StripeProvider) talks to it over
//! HTTP; tests substitute their own implementation or a mock server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        kind: Option<String>,
    },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("billing provider is not configured")]
    NotConfigured,
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::Api { status: 404, .. })
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotConfigured => AppError::ServiceUnavailable,
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    #[serde(default)]
    pub lookup_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    #[serde(default)]
    pub price: ProviderPrice,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: ItemList,
    #[serde(default)]
    pub default_payment_method: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Unix seconds to UTC; out-of-range values are dropped.
pub fn from_unix(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|secs| DateTime::from_timestamp(secs, 0))
}

impl ProviderSubscription {
    /// Price of the first item, which carries the plan.
    pub fn primary_price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }

    /// The metered item for `metric`, matched on the price lookup key.
    pub fn item_for_metric(&self, metric: &str) -> Option<&SubscriptionItem> {
        self.items.data.iter().find(|item| {
            item.price.lookup_key.as_deref() == Some(metric)
                || item.price.metadata.get("lookup_key").map(String::as_str) == Some(metric)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageAction {
    /// Add to the quantity already reported for the period.
    Increment,
    /// Replace the quantity reported for the period.
    Set,
}

impl UsageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageAction::Increment => "increment",
            UsageAction::Set => "set",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub tenant_id: Uuid,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub trial_days: u32,
    pub default_payment_method: Option<String>,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct NewUsageReport {
    pub subscription_item_id: String,
    pub quantity: i64,
    pub timestamp: i64,
    pub action: UsageAction,
    /// Replays with the same key are collapsed by the provider.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderUsageRecord {
    pub id: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub subscription_item: Option<String>,
}

/// Changes to an existing subscription. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    /// Move an existing item (`item_id`) onto `price_id`.
    pub item_price: Option<ItemPrice>,
    pub proration_behavior: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    pub default_payment_method: Option<String>,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPrice {
    pub item_id: String,
    pub price_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct NewCheckoutSession {
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
}

/// Amounts are in the currency's minor unit. The upcoming invoice has no id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_remaining: i64,
    #[serde(default)]
    pub subtotal: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub tax: Option<i64>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceList {
    #[serde(default)]
    pub data: Vec<Invoice>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_customer(&self, req: &NewCustomer) -> Result<ProviderCustomer, ProviderError>;

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError>;

    async fn create_subscription(
        &self,
        req: &NewSubscription,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<ProviderSubscription, ProviderError>;

    /// Cancel now, or flag the subscription to end with the current period.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn create_usage_record(
        &self,
        req: &NewUsageReport,
    ) -> Result<ProviderUsageRecord, ProviderError>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, ProviderError>;

    async fn create_checkout_session(
        &self,
        req: &NewCheckoutSession,
    ) -> Result<CheckoutSession, ProviderError>;

    /// Preview of the next invoice for the customer.
    async fn upcoming_invoice(&self, customer_id: &str) -> Result<Invoice, ProviderError>;

    /// Most recent invoices first, at most `limit`.
    async fn list_invoices(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Invoice>, ProviderError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider for unit tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct StubProvider {
        pub subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
        pub usage_reports: Mutex<Vec<NewUsageReport>>,
        pub created_subscriptions: Mutex<Vec<NewSubscription>>,
        pub updates: Mutex<Vec<(String, SubscriptionUpdate)>>,
        pub checkouts: Mutex<Vec<NewCheckoutSession>>,
        pub invoices: Mutex<Vec<Invoice>>,
        pub fail_usage: std::sync::atomic::AtomicBool,
    }

    impl StubProvider {
        pub fn with_subscription(self, sub: ProviderSubscription) -> Self {
            self.subscriptions
                .lock()
                .unwrap()
                .insert(sub.id.clone(), sub);
            self
        }

        pub fn set_subscription(&self, sub: ProviderSubscription) {
            self.subscriptions
                .lock()
                .unwrap()
                .insert(sub.id.clone(), sub);
        }
    }

    pub fn subscription(id: &str, status: &str, price_id: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            customer: Some("cus_1".into()),
            status: status.to_string(),
            current_period_start: Some(1_700_000_000),
            current_period_end: Some(1_702_592_000),
            cancel_at_period_end: false,
            cancel_at: None,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            items: ItemList {
                data: vec![SubscriptionItem {
                    id: format!("si_{}", id),
                    price: ProviderPrice {
                        id: price_id.to_string(),
                        lookup_key: None,
                        metadata: HashMap::new(),
                    },
                }],
            },
            default_payment_method: Some("pm_1".into()),
            metadata: HashMap::new(),
        }
    }

    fn not_found(what: &str) -> ProviderError {
        ProviderError::Api {
            status: 404,
            message: format!("No such {}", what),
            kind: Some("invalid_request_error".into()),
        }
    }

    #[async_trait]
    impl BillingProvider for StubProvider {
        async fn create_customer(
            &self,
            req: &NewCustomer,
        ) -> Result<ProviderCustomer, ProviderError> {
            Ok(ProviderCustomer {
                id: format!("cus_{}", req.tenant_id.simple()),
                email: Some(req.email.clone()),
                name: Some(req.name.clone()),
                metadata: HashMap::new(),
            })
        }

        async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
            Ok(ProviderCustomer {
                id: customer_id.to_string(),
                email: None,
                name: None,
                metadata: HashMap::new(),
            })
        }

        async fn create_subscription(
            &self,
            req: &NewSubscription,
        ) -> Result<ProviderSubscription, ProviderError> {
            self.created_subscriptions.lock().unwrap().push(req.clone());
            let status = if req.trial_days > 0 { "trialing" } else { "active" };
            let sub = subscription("sub_new", status, &req.price_id);
            self.set_subscription(sub.clone());
            Ok(sub)
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<ProviderSubscription, ProviderError> {
            self.subscriptions
                .lock()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| not_found("subscription"))
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            update: &SubscriptionUpdate,
        ) -> Result<ProviderSubscription, ProviderError> {
            self.updates
                .lock()
                .unwrap()
                .push((subscription_id.to_string(), update.clone()));
            let mut subs = self.subscriptions.lock().unwrap();
            let sub = subs
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("subscription"))?;
            if let Some(change) = &update.item_price {
                if let Some(item) = sub.items.data.iter_mut().find(|i| i.id == change.item_id) {
                    item.price.id = change.price_id.clone();
                }
            }
            if let Some(flag) = update.cancel_at_period_end {
                sub.cancel_at_period_end = flag;
            }
            if let Some(pm) = &update.default_payment_method {
                sub.default_payment_method = Some(pm.clone());
            }
            Ok(sub.clone())
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
            at_period_end: bool,
        ) -> Result<ProviderSubscription, ProviderError> {
            let mut subs = self.subscriptions.lock().unwrap();
            let sub = subs
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("subscription"))?;
            if at_period_end {
                sub.cancel_at_period_end = true;
                sub.cancel_at = sub.current_period_end;
            } else {
                sub.status = "canceled".into();
                sub.canceled_at = Some(Utc::now().timestamp());
            }
            Ok(sub.clone())
        }

        async fn create_usage_record(
            &self,
            req: &NewUsageReport,
        ) -> Result<ProviderUsageRecord, ProviderError> {
            if self.fail_usage.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ProviderError::Transport("connection reset".into()));
            }
            let mut reports = self.usage_reports.lock().unwrap();
            reports.push(req.clone());
            Ok(ProviderUsageRecord {
                id: format!("mbur_{}", reports.len()),
                quantity: req.quantity,
                subscription_item: Some(req.subscription_item_id.clone()),
            })
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            return_url: &str,
        ) -> Result<PortalSession, ProviderError> {
            Ok(PortalSession {
                id: "bps_1".into(),
                url: format!("https://billing.example.test/{}?return={}", customer_id, return_url),
            })
        }

        async fn create_checkout_session(
            &self,
            req: &NewCheckoutSession,
        ) -> Result<CheckoutSession, ProviderError> {
            self.checkouts.lock().unwrap().push(req.clone());
            Ok(CheckoutSession {
                id: Some("cs_1".into()),
                url: format!("https://checkout.example.test/{}", req.price_id),
            })
        }

        async fn upcoming_invoice(&self, customer_id: &str) -> Result<Invoice, ProviderError> {
            Ok(Invoice {
                customer: Some(customer_id.to_string()),
                currency: "usd".into(),
                amount_due: 9_900,
                ..Invoice::default()
            })
        }

        async fn list_invoices(
            &self,
            _customer_id: &str,
            limit: u32,
        ) -> Result<Vec<Invoice>, ProviderError> {
            let invoices = self.invoices.lock().unwrap();
            Ok(invoices.iter().take(limit as usize).cloned().collect())
        }
    }
}
