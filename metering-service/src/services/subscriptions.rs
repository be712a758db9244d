//! Subscription authority: lazy free tier, provider-backed lifecycle and
//! reconciliation from provider snapshots.

use crate::models::{
    Plan, PlanCatalog, PlanConfig, Subscription, SubscriptionSnapshot, SyncOutcome, UsageMetric,
    UNLIMITED,
};
use crate::services::metrics::{record_error, record_subscription_operation};
use crate::services::provider::{
    from_unix, BillingProvider, Invoice, ItemPrice, NewCheckoutSession, NewCustomer,
    NewSubscription, ProviderSubscription, SubscriptionUpdate,
};
use crate::services::store::SubscriptionStore;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Upper bound for one invoice listing.
pub const MAX_INVOICES: u32 = 100;

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            store,
            provider,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The tenant's subscription, created on first access as an active
    /// free-tier row with a one-month period.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn get_by_tenant(&self, tenant_id: Uuid) -> Result<Subscription, AppError> {
        if let Some(subscription) = self.store.find_by_tenant(tenant_id).await? {
            return Ok(subscription);
        }

        let subscription = self
            .store
            .insert_if_absent(&Subscription::free_tier(tenant_id, Utc::now()))
            .await?;
        record_subscription_operation("create_free_tier");
        Ok(subscription)
    }

    /// Create the provider customer once; later calls return the existing link.
    #[instrument(skip(self, email, name), fields(tenant_id = %tenant_id))]
    pub async fn create_provider_customer(
        &self,
        tenant_id: Uuid,
        email: &str,
        name: &str,
    ) -> Result<Subscription, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        if subscription.provider_customer_id.is_some() {
            return Ok(subscription);
        }

        let customer = self
            .provider
            .create_customer(&NewCustomer {
                tenant_id,
                email: email.to_string(),
                name: name.to_string(),
            })
            .await
            .inspect_err(|_| record_error("provider", "create_customer"))?;

        let subscription = self
            .store
            .set_provider_customer(tenant_id, &customer.id)
            .await?;
        record_subscription_operation("create_customer");
        info!(customer_id = %customer.id, "Provider customer linked");

        Ok(subscription)
    }

    #[instrument(skip(self, payment_method_id), fields(tenant_id = %tenant_id))]
    pub async fn subscribe(
        &self,
        tenant_id: Uuid,
        plan_name: &str,
        payment_method_id: Option<String>,
    ) -> Result<Subscription, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        let customer_id = subscription.provider_customer_id.clone().ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("Tenant has no billing provider customer"))
        })?;

        let (plan_config, price_id) = self.priced_plan(plan_name)?;

        let created = self
            .provider
            .create_subscription(&NewSubscription {
                customer_id,
                price_id: price_id.clone(),
                trial_days: plan_config.trial_days,
                default_payment_method: payment_method_id.clone(),
                metadata: vec![
                    ("tenant_id".to_string(), tenant_id.to_string()),
                    ("plan".to_string(), plan_config.plan.as_str().to_string()),
                ],
            })
            .await
            .inspect_err(|_| record_error("provider", "create_subscription"))?;

        let mut snapshot = to_snapshot(&created, Some((plan_config.plan, price_id)));
        if snapshot.default_payment_method_id.is_none() {
            snapshot.default_payment_method_id = payment_method_id;
        }

        let subscription = self.store.apply_snapshot(tenant_id, &snapshot).await?;
        record_subscription_operation("subscribe");
        info!(
            plan = %subscription.plan,
            status = %subscription.status,
            provider_subscription_id = %created.id,
            "Tenant subscribed"
        );

        Ok(subscription)
    }

    /// Free-tier rows are canceled locally; provider subscriptions are
    /// canceled remotely (now, or at period end) and the response is stored.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn cancel(&self, tenant_id: Uuid, immediate: bool) -> Result<Subscription, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;

        let Some(provider_subscription_id) = subscription.provider_subscription_id.as_deref()
        else {
            let subscription = self.store.mark_canceled(tenant_id).await?;
            record_subscription_operation("cancel_local");
            return Ok(subscription);
        };

        let canceled = self
            .provider
            .cancel_subscription(provider_subscription_id, !immediate)
            .await
            .inspect_err(|_| record_error("provider", "cancel_subscription"))?;

        let snapshot = to_snapshot(&canceled, self.plan_for(&canceled));
        let subscription = self.store.apply_snapshot(tenant_id, &snapshot).await?;
        record_subscription_operation(if immediate {
            "cancel_immediate"
        } else {
            "cancel_at_period_end"
        });

        Ok(subscription)
    }

    #[instrument(skip(self, return_url), fields(tenant_id = %tenant_id))]
    pub async fn billing_portal_url(
        &self,
        tenant_id: Uuid,
        return_url: &str,
    ) -> Result<String, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        let customer_id = subscription.provider_customer_id.ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("Tenant has no billing provider customer"))
        })?;

        let session = self
            .provider
            .create_portal_session(&customer_id, return_url)
            .await
            .inspect_err(|_| record_error("provider", "create_portal_session"))?;

        Ok(session.url)
    }

    /// Move a provider subscription onto another paid plan. The provider
    /// prorates the change; the response overwrites local state.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn change_plan(
        &self,
        tenant_id: Uuid,
        plan_name: &str,
    ) -> Result<Subscription, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        let provider_subscription_id =
            subscription.provider_subscription_id.clone().ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!("Tenant has no provider subscription"))
            })?;
        let (plan_config, price_id) = self.priced_plan(plan_name)?;

        let remote = self
            .provider
            .get_subscription(&provider_subscription_id)
            .await
            .inspect_err(|_| record_error("provider", "get_subscription"))?;
        let item_id = remote
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| {
                AppError::BadGateway(format!(
                    "Provider subscription {} has no items",
                    provider_subscription_id
                ))
            })?;

        let updated = self
            .provider
            .update_subscription(
                &provider_subscription_id,
                &SubscriptionUpdate {
                    item_price: Some(ItemPrice {
                        item_id,
                        price_id: price_id.clone(),
                    }),
                    proration_behavior: Some("create_prorations".to_string()),
                    metadata: vec![("plan".to_string(), plan_config.plan.as_str().to_string())],
                    ..SubscriptionUpdate::default()
                },
            )
            .await
            .inspect_err(|_| record_error("provider", "update_subscription"))?;

        let snapshot = to_snapshot(&updated, Some((plan_config.plan, price_id)));
        let subscription = self.store.apply_snapshot(tenant_id, &snapshot).await?;
        record_subscription_operation("change_plan");
        info!(plan = %subscription.plan, "Subscription plan changed");

        Ok(subscription)
    }

    /// Hosted checkout URL for a paid plan. Tenants without a provider
    /// customer are identified by `email` instead.
    #[instrument(skip(self, email, success_url, cancel_url), fields(tenant_id = %tenant_id))]
    pub async fn checkout_url(
        &self,
        tenant_id: Uuid,
        plan_name: &str,
        email: Option<String>,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, AppError> {
        let (plan_config, price_id) = self.priced_plan(plan_name)?;
        let subscription = self.get_by_tenant(tenant_id).await?;

        let session = self
            .provider
            .create_checkout_session(&NewCheckoutSession {
                price_id,
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                customer_id: subscription.provider_customer_id,
                customer_email: email.filter(|e| !e.trim().is_empty()),
                metadata: vec![
                    ("tenant_id".to_string(), tenant_id.to_string()),
                    ("plan".to_string(), plan_config.plan.as_str().to_string()),
                ],
            })
            .await
            .inspect_err(|_| record_error("provider", "create_checkout_session"))?;
        record_subscription_operation("checkout");

        Ok(session.url)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn upcoming_invoice(&self, tenant_id: Uuid) -> Result<Invoice, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        let customer_id = subscription.provider_customer_id.ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("Tenant has no billing provider customer"))
        })?;

        Ok(self
            .provider
            .upcoming_invoice(&customer_id)
            .await
            .inspect_err(|_| record_error("provider", "upcoming_invoice"))?)
    }

    /// Past invoices, newest first. Tenants never billed have none.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_invoices(&self, tenant_id: Uuid, limit: u32) -> Result<Vec<Invoice>, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        let Some(customer_id) = subscription.provider_customer_id else {
            return Ok(Vec::new());
        };

        Ok(self
            .provider
            .list_invoices(&customer_id, limit.clamp(1, MAX_INVOICES))
            .await
            .inspect_err(|_| record_error("provider", "list_invoices"))?)
    }

    /// `(exceeded, limit)` for `current_usage` against the tenant's plan.
    /// Unlimited caps and unknown metrics never report exceeded and return `-1`.
    pub async fn check_usage_limit(
        &self,
        tenant_id: Uuid,
        metric: &str,
        current_usage: i64,
    ) -> Result<(bool, i64), AppError> {
        let Some(metric) = UsageMetric::parse(metric) else {
            warn!(tenant_id = %tenant_id, metric, "Limit check for unknown metric");
            return Ok((false, UNLIMITED));
        };

        let subscription = self.get_by_tenant(tenant_id).await?;
        let limit = subscription
            .plan_config(&self.catalog)
            .limits
            .for_metric(metric);

        if limit == UNLIMITED {
            return Ok((false, UNLIMITED));
        }
        Ok((current_usage >= limit, limit))
    }

    pub async fn has_feature(&self, tenant_id: Uuid, feature: &str) -> Result<bool, AppError> {
        let subscription = self.get_by_tenant(tenant_id).await?;
        Ok(subscription.plan_config(&self.catalog).has_feature(feature))
    }

    /// Overwrite local state with the provider's current view of the
    /// subscription. Idempotent: re-applying an unchanged snapshot is a no-op.
    #[instrument(skip(self))]
    pub async fn sync_from_provider(
        &self,
        provider_subscription_id: &str,
    ) -> Result<SyncOutcome, AppError> {
        let remote = self
            .provider
            .get_subscription(provider_subscription_id)
            .await
            .inspect_err(|_| record_error("provider", "get_subscription"))?;

        let snapshot = to_snapshot(&remote, self.plan_for(&remote));
        let outcome = self.store.sync_snapshot(&snapshot).await?;

        match outcome {
            SyncOutcome::NotFound => warn!(
                provider_subscription_id,
                "No local subscription for provider subscription"
            ),
            _ => info!(
                provider_subscription_id,
                status = %remote.status,
                outcome = outcome.as_str(),
                "Subscription synced from provider"
            ),
        }
        record_subscription_operation(&format!("sync_{}", outcome.as_str()));

        Ok(outcome)
    }

    /// A catalog plan that has a provider price.
    fn priced_plan(&self, plan_name: &str) -> Result<(&PlanConfig, String), AppError> {
        let plan_config = self
            .catalog
            .lookup(plan_name)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Unknown plan: {}", plan_name)))?;
        let price_id = plan_config.provider_price_id.clone().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Plan {} cannot be subscribed to through the provider",
                plan_name
            ))
        })?;
        Ok((plan_config, price_id))
    }

    fn plan_for(&self, remote: &ProviderSubscription) -> Option<(Plan, String)> {
        let price_id = remote.primary_price_id()?;
        self.catalog
            .plan_for_price(price_id)
            .map(|plan| (plan, price_id.to_string()))
    }
}

fn to_snapshot(remote: &ProviderSubscription, plan: Option<(Plan, String)>) -> SubscriptionSnapshot {
    let (plan, provider_price_id) = match plan {
        Some((plan, price)) => (Some(plan), Some(price)),
        None => (None, None),
    };

    SubscriptionSnapshot {
        provider_subscription_id: remote.id.clone(),
        provider_price_id,
        plan,
        status: remote.status.clone(),
        current_period_start: from_unix(remote.current_period_start),
        current_period_end: from_unix(remote.current_period_end),
        trial_start: from_unix(remote.trial_start),
        trial_end: from_unix(remote.trial_end),
        cancel_at: from_unix(remote.cancel_at),
        canceled_at: from_unix(remote.canceled_at),
        cancel_at_period_end: remote.cancel_at_period_end,
        default_payment_method_id: remote.default_payment_method.clone(),
    }
}
