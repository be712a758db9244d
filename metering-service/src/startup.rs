//! Application startup and lifecycle management.

use crate::config::MeteringConfig;
use crate::handlers::{self, billing, webhook};
use crate::models::PlanCatalog;
use crate::services::{
    init_metrics, BillingProvider, Database, LimitEnforcer, StripeProvider, SubscriptionService,
    SubscriptionStore, UsageReporter, UsageStore, UsageTracker,
};
use crate::webhooks::WebhookProcessor;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MeteringConfig,
    pub usage_store: Arc<dyn UsageStore>,
    pub tracker: Arc<UsageTracker>,
    pub subscriptions: Arc<SubscriptionService>,
    pub limits: Arc<LimitEnforcer>,
    pub webhooks: Arc<WebhookProcessor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/webhooks/billing", post(webhook::billing_webhook))
        .route(
            "/v1/tenants/:tenant_id/usage",
            post(billing::track_usage).get(billing::get_usage),
        )
        .route(
            "/v1/tenants/:tenant_id/limits/:metric",
            get(billing::check_limit),
        )
        .route(
            "/v1/tenants/:tenant_id/subscription",
            get(billing::get_subscription).post(billing::subscribe),
        )
        .route(
            "/v1/tenants/:tenant_id/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/v1/tenants/:tenant_id/subscription/plan",
            post(billing::change_plan),
        )
        .route("/v1/tenants/:tenant_id/customer", post(billing::create_customer))
        .route("/v1/tenants/:tenant_id/portal", post(billing::billing_portal))
        .route("/v1/tenants/:tenant_id/checkout", post(billing::create_checkout))
        .route("/v1/tenants/:tenant_id/invoices", get(billing::list_invoices))
        .route(
            "/v1/tenants/:tenant_id/invoices/upcoming",
            get(billing::upcoming_invoice),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    reporter_cancel: CancellationToken,
    reporter_task: Option<JoinHandle<()>>,
}

impl Application {
    /// Build the application against PostgreSQL, running migrations first.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let db = Arc::new(db);
        Self::build_with_stores(config, db.clone(), db).await
    }

    /// Build the application on top of the given stores.
    /// Tests use this with the in-memory store.
    pub async fn build_with_stores(
        config: MeteringConfig,
        usage_store: Arc<dyn UsageStore>,
        subscription_store: Arc<dyn SubscriptionStore>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let provider = StripeProvider::new(config.provider.clone())?;
        if provider.is_configured() {
            tracing::info!(base_url = %config.provider.base_url, "Billing provider client initialized");
        } else {
            tracing::warn!("Billing provider secret key not configured - provider calls will fail");
        }
        let provider: Arc<dyn BillingProvider> = Arc::new(provider);

        let catalog = Arc::new(PlanCatalog::new(config.prices.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(
            subscription_store.clone(),
            provider.clone(),
            catalog,
        ));
        let tracker = Arc::new(UsageTracker::spawn(
            &config.tracker,
            usage_store.clone(),
            subscription_store.clone(),
        ));
        let limits = Arc::new(LimitEnforcer::new(
            subscriptions.clone(),
            usage_store.clone(),
            tracker.clone(),
        ));

        let webhooks = Arc::new(WebhookProcessor::new(&config.webhook, subscriptions.clone()));
        if !webhooks.verification_enabled() {
            tracing::warn!("Billing webhook secret not configured - signature verification disabled");
        }

        let reporter_cancel = CancellationToken::new();
        let reporter_task = config.reporting.interval.map(|interval| {
            tracing::info!(interval_secs = interval.as_secs(), "Usage reporter enabled");
            Arc::new(UsageReporter::new(
                usage_store.clone(),
                subscription_store.clone(),
                provider.clone(),
            ))
            .spawn(interval, reporter_cancel.clone())
        });

        let state = AppState {
            config: config.clone(),
            usage_store,
            tracker,
            subscriptions,
            limits,
            webhooks,
        };

        // Port 0 binds a random port for tests
        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Metering service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            reporter_cancel,
            reporter_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until the process is killed.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then drain in-flight requests, flush
    /// buffered usage and stop background tasks.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            port,
            listener,
            state,
            reporter_cancel,
            reporter_task,
        } = self;

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            port = port,
            "Service ready to accept connections"
        );

        let served = axum::serve(listener, router(state.clone()))
            .with_graceful_shutdown(signal)
            .await;
        if let Err(e) = &served {
            tracing::error!(error = %e, "HTTP server error");
        }

        let close_timeout = state.config.tracker.close_timeout;
        match state.tracker.close_within(close_timeout).await {
            Ok(report) => tracing::info!(
                records = report.records,
                quantity = report.quantity,
                "Final usage flush completed"
            ),
            Err(e) => tracing::error!(
                error = %e,
                buffered_keys = state.tracker.buffered_keys(),
                "Final usage flush failed, usage left unrecorded"
            ),
        }

        reporter_cancel.cancel();
        if let Some(task) = reporter_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Usage reporter task panicked");
            }
        }

        served
    }
}
