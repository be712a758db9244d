//! HTTP client for the Stripe-compatible billing provider.
//!
//! Form-encoded requests, basic auth with the secret key and a pinned API
//! version. Non-2xx answers are decoded from the provider's error envelope.

use crate::config::ProviderConfig;
use crate::services::metrics::PROVIDER_REQUEST_DURATION;
use crate::services::provider::{
    BillingProvider, CheckoutSession, Invoice, InvoiceList, NewCheckoutSession, NewCustomer,
    NewSubscription, NewUsageReport, PortalSession, ProviderCustomer, ProviderError,
    ProviderSubscription, ProviderUsageRecord, SubscriptionUpdate,
};
use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::instrument;

pub const API_VERSION: &str = "2023-10-16";

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

type Pairs = [(String, String)];

enum Params<'a> {
    Empty,
    Form(&'a Pairs),
    Query(&'a Pairs),
}

#[derive(Clone)]
pub struct StripeProvider {
    client: Client,
    config: ProviderConfig,
}

impl StripeProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Check if the secret key is set.
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        params: Params<'_>,
        idempotency_key: Option<&str>,
    ) -> Result<T, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured);
        }

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .header("Stripe-Version", API_VERSION);
        match params {
            Params::Empty => {}
            Params::Form(form) => request = request.form(form),
            Params::Query(query) => request = request.query(query),
        }
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let started = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            PROVIDER_REQUEST_DURATION
                .with_label_values(&[operation, "transport_error"])
                .observe(started.elapsed().as_secs_f64());
            ProviderError::Transport(e.to_string())
        })?;

        let status = response.status();
        PROVIDER_REQUEST_DURATION
            .with_label_values(&[operation, status.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        tracing::debug!(operation, status = %status, "Billing provider response");

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))
        } else {
            let (kind, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => (
                    envelope.error.kind,
                    envelope.error.message.unwrap_or_else(|| body.clone()),
                ),
                Err(_) => (None, body),
            };
            tracing::warn!(
                operation,
                status = status.as_u16(),
                kind = ?kind,
                message = %message,
                "Billing provider request failed"
            );
            Err(ProviderError::Api {
                status: status.as_u16(),
                message,
                kind,
            })
        }
    }
}

fn pair(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

fn update_form(update: &SubscriptionUpdate) -> Vec<(String, String)> {
    let mut form = Vec::new();
    if let Some(change) = &update.item_price {
        form.push(pair("items[0][id]", change.item_id.as_str()));
        form.push(pair("items[0][price]", change.price_id.as_str()));
    }
    if let Some(behavior) = &update.proration_behavior {
        form.push(pair("proration_behavior", behavior.as_str()));
    }
    if let Some(flag) = update.cancel_at_period_end {
        form.push(pair("cancel_at_period_end", flag.to_string()));
    }
    if let Some(pm) = &update.default_payment_method {
        form.push(pair("default_payment_method", pm.as_str()));
    }
    for (key, value) in &update.metadata {
        form.push(pair(&format!("metadata[{}]", key), value.as_str()));
    }
    form
}

#[async_trait]
impl BillingProvider for StripeProvider {
    #[instrument(skip(self, req), fields(tenant_id = %req.tenant_id))]
    async fn create_customer(&self, req: &NewCustomer) -> Result<ProviderCustomer, ProviderError> {
        let form = vec![
            pair("email", req.email.as_str()),
            pair("name", req.name.as_str()),
            pair("metadata[tenant_id]", req.tenant_id.to_string()),
        ];
        let customer: ProviderCustomer = self
            .send("create_customer", Method::POST, "/v1/customers", Params::Form(&form), None)
            .await?;

        tracing::info!(customer_id = %customer.id, "Provider customer created");
        Ok(customer)
    }

    #[instrument(skip(self))]
    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        self.send(
            "get_customer",
            Method::GET,
            &format!("/v1/customers/{}", customer_id),
            Params::Empty,
            None,
        )
        .await
    }

    #[instrument(skip(self, req), fields(customer_id = %req.customer_id, price_id = %req.price_id))]
    async fn create_subscription(
        &self,
        req: &NewSubscription,
    ) -> Result<ProviderSubscription, ProviderError> {
        let mut form = vec![
            pair("customer", req.customer_id.as_str()),
            pair("items[0][price]", req.price_id.as_str()),
        ];
        if req.trial_days > 0 {
            form.push(pair("trial_period_days", req.trial_days.to_string()));
        }
        if let Some(pm) = &req.default_payment_method {
            form.push(pair("default_payment_method", pm.as_str()));
        }
        for (key, value) in &req.metadata {
            form.push(pair(&format!("metadata[{}]", key), value.as_str()));
        }

        let subscription: ProviderSubscription = self
            .send(
                "create_subscription",
                Method::POST,
                "/v1/subscriptions",
                Params::Form(&form),
                None,
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Provider subscription created"
        );
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.send(
            "get_subscription",
            Method::GET,
            &format!("/v1/subscriptions/{}", subscription_id),
            Params::Empty,
            None,
        )
        .await
    }

    #[instrument(skip(self, update))]
    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<ProviderSubscription, ProviderError> {
        let form = update_form(update);
        let subscription: ProviderSubscription = self
            .send(
                "update_subscription",
                Method::POST,
                &format!("/v1/subscriptions/{}", subscription_id),
                Params::Form(&form),
                None,
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Provider subscription updated"
        );
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<ProviderSubscription, ProviderError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        if at_period_end {
            let form = vec![pair("cancel_at_period_end", "true")];
            self.send(
                "cancel_subscription",
                Method::POST,
                &path,
                Params::Form(&form),
                None,
            )
            .await
        } else {
            self.send("cancel_subscription", Method::DELETE, &path, Params::Empty, None)
                .await
        }
    }

    #[instrument(skip(self, req), fields(item = %req.subscription_item_id, quantity = req.quantity))]
    async fn create_usage_record(
        &self,
        req: &NewUsageReport,
    ) -> Result<ProviderUsageRecord, ProviderError> {
        let form = vec![
            pair("quantity", req.quantity.to_string()),
            pair("timestamp", req.timestamp.to_string()),
            pair("action", req.action.as_str()),
        ];
        self.send(
            "create_usage_record",
            Method::POST,
            &format!(
                "/v1/subscription_items/{}/usage_records",
                req.subscription_item_id
            ),
            Params::Form(&form),
            req.idempotency_key.as_deref(),
        )
        .await
    }

    #[instrument(skip(self, return_url))]
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, ProviderError> {
        let form = vec![pair("customer", customer_id), pair("return_url", return_url)];
        self.send(
            "create_portal_session",
            Method::POST,
            "/v1/billing_portal/sessions",
            Params::Form(&form),
            None,
        )
        .await
    }

    #[instrument(skip(self, req), fields(price_id = %req.price_id))]
    async fn create_checkout_session(
        &self,
        req: &NewCheckoutSession,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut form = vec![
            pair("mode", "subscription"),
            pair("success_url", req.success_url.as_str()),
            pair("cancel_url", req.cancel_url.as_str()),
            pair("line_items[0][price]", req.price_id.as_str()),
            pair("line_items[0][quantity]", "1"),
        ];
        if let Some(customer) = &req.customer_id {
            form.push(pair("customer", customer.as_str()));
        } else if let Some(email) = &req.customer_email {
            form.push(pair("customer_email", email.as_str()));
        }
        for (key, value) in &req.metadata {
            form.push(pair(&format!("metadata[{}]", key), value.as_str()));
        }

        self.send(
            "create_checkout_session",
            Method::POST,
            "/v1/checkout/sessions",
            Params::Form(&form),
            None,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn upcoming_invoice(&self, customer_id: &str) -> Result<Invoice, ProviderError> {
        let query = vec![pair("customer", customer_id)];
        self.send(
            "upcoming_invoice",
            Method::GET,
            "/v1/invoices/upcoming",
            Params::Query(&query),
            None,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_invoices(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Invoice>, ProviderError> {
        let query = vec![pair("customer", customer_id), pair("limit", limit.to_string())];
        let list: InvoiceList = self
            .send(
                "list_invoices",
                Method::GET,
                "/v1/invoices",
                Params::Query(&query),
                None,
            )
            .await?;
        Ok(list.data)
    }
}
