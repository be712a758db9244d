//! Tenant-scoped usage and subscription endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    models::{BillingPeriod, PlanConfig, Subscription, UsageMetric, UsageTotals},
    services::{provider::Invoice, LimitCheck},
    startup::AppState,
};

#[derive(Debug, Deserialize)]
pub struct TrackUsageRequest {
    pub metric: String,
    #[serde(default = "default_quantity")]
    pub quantity: u64,
}

fn default_quantity() -> u64 {
    1
}

#[derive(Debug, Serialize)]
pub struct TrackUsageResponse {
    pub tenant_id: Uuid,
    pub metric: UsageMetric,
    pub quantity: u64,
    /// Quantity buffered for this key and not yet flushed.
    pub pending: i64,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub tenant_id: Uuid,
    pub period: BillingPeriod,
    pub usage: UsageTotals,
    pub limits: Vec<LimitCheck>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
    pub plan: PlanConfig,
    pub is_active: bool,
    pub is_trial: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan: String,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub return_url: String,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
    pub success_url: String,
    pub cancel_url: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceQuery {
    #[serde(default = "default_invoice_limit")]
    pub limit: u32,
}

fn default_invoice_limit() -> u32 {
    10
}

#[derive(Debug, Serialize)]
pub struct InvoicesResponse {
    pub tenant_id: Uuid,
    pub invoices: Vec<Invoice>,
}

fn subscription_response(state: &AppState, subscription: Subscription) -> SubscriptionResponse {
    let plan = subscription
        .plan_config(state.subscriptions.catalog())
        .clone();
    SubscriptionResponse {
        is_active: subscription.is_active(),
        is_trial: subscription.is_trial(),
        subscription,
        plan,
    }
}

/// Record usage for a tenant. Accepted into the buffer, written on the next flush.
pub async fn track_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<TrackUsageRequest>,
) -> Result<(StatusCode, Json<TrackUsageResponse>), AppError> {
    let metric = UsageMetric::parse(&req.metric).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Unknown usage metric: {}", req.metric))
    })?;

    state.tracker.track(tenant_id, metric, req.quantity)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TrackUsageResponse {
            tenant_id,
            metric,
            quantity: req.quantity,
            pending: state.tracker.pending(tenant_id, metric),
        }),
    ))
}

/// Current-period totals with the plan limit for each metric.
pub async fn get_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<UsageResponse>, AppError> {
    let usage = state.tracker.current_usage(tenant_id).await?;
    let limits = state.limits.check_all(tenant_id).await?;

    Ok(Json(UsageResponse {
        tenant_id,
        period: usage.period,
        usage,
        limits,
    }))
}

pub async fn check_limit(
    State(state): State<AppState>,
    Path((tenant_id, metric)): Path<(Uuid, String)>,
) -> Result<Json<LimitCheck>, AppError> {
    Ok(Json(state.limits.check(tenant_id, &metric).await?))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.subscriptions.get_by_tenant(tenant_id).await?;
    Ok(Json(subscription_response(&state, subscription)))
}

pub async fn create_customer(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), AppError> {
    if req.email.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("email is required")));
    }
    let subscription = state
        .subscriptions
        .create_provider_customer(tenant_id, &req.email, &req.name)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(subscription_response(&state, subscription)),
    ))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state
        .subscriptions
        .subscribe(tenant_id, &req.plan, req.payment_method_id)
        .await?;
    Ok(Json(subscription_response(&state, subscription)))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    req: Option<Json<CancelRequest>>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let immediate = req.is_some_and(|Json(r)| r.immediate);
    let subscription = state.subscriptions.cancel(tenant_id, immediate).await?;
    Ok(Json(subscription_response(&state, subscription)))
}

pub async fn billing_portal(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<PortalRequest>,
) -> Result<Json<PortalResponse>, AppError> {
    let url = state
        .subscriptions
        .billing_portal_url(tenant_id, &req.return_url)
        .await?;
    Ok(Json(PortalResponse { url }))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<ChangePlanRequest>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.subscriptions.change_plan(tenant_id, &req.plan).await?;
    Ok(Json(subscription_response(&state, subscription)))
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    if req.success_url.trim().is_empty() || req.cancel_url.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "success_url and cancel_url are required"
        )));
    }
    let url = state
        .subscriptions
        .checkout_url(tenant_id, &req.plan, req.email, &req.success_url, &req.cancel_url)
        .await?;
    Ok(Json(CheckoutResponse { url }))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<InvoiceQuery>,
) -> Result<Json<InvoicesResponse>, AppError> {
    let invoices = state
        .subscriptions
        .list_invoices(tenant_id, query.limit)
        .await?;
    Ok(Json(InvoicesResponse {
        tenant_id,
        invoices,
    }))
}

pub async fn upcoming_invoice(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.subscriptions.upcoming_invoice(tenant_id).await?))
}
