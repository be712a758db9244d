//! Test helper module for metering-service integration tests.
//!
//! Spawns the application on a random port over the in-memory store, with the
//! billing provider replaced by a wiremock server.

#![allow(dead_code)]

use chrono::Utc;
use metering_service::config::{
    DatabaseConfig, MeteringConfig, ProviderConfig, ReportingConfig, TrackerConfig, WebhookConfig,
};
use metering_service::models::PriceIds;
use metering_service::services::{InMemoryStore, UsageTracker};
use metering_service::startup::Application;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use service_core::utils::generate_timestamped_signature;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wiremock::MockServer;

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const PROVIDER_KEY: &str = "sk_test_integration";
pub const PRICE_PRO: &str = "price_pro_monthly";
pub const PRICE_ENTERPRISE: &str = "price_enterprise_monthly";

pub fn test_config(provider_url: &str) -> MeteringConfig {
    MeteringConfig {
        common: CoreConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Random port
        },
        service_name: "metering-service-test".to_string(),
        service_version: "0.1.0".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        // Long interval: tests flush explicitly or through the size trigger.
        tracker: TrackerConfig {
            flush_interval: Duration::from_secs(3600),
            flush_threshold: 100,
            close_timeout: Duration::from_secs(5),
        },
        reporting: ReportingConfig { interval: None },
        provider: ProviderConfig {
            base_url: provider_url.to_string(),
            secret_key: Secret::new(PROVIDER_KEY.to_string()),
            timeout: Duration::from_secs(5),
        },
        webhook: WebhookConfig {
            secret: Secret::new(WEBHOOK_SECRET.to_string()),
            tolerance_secs: 300,
        },
        prices: PriceIds {
            pro: Some(PRICE_PRO.to_string()),
            enterprise: Some(PRICE_ENTERPRISE.to_string()),
        },
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<InMemoryStore>,
    pub provider: MockServer,
    pub tracker: Arc<UsageTracker>,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config tweak applied before the application is built.
    pub async fn spawn_with(customize: impl FnOnce(&mut MeteringConfig)) -> Self {
        let provider = MockServer::start().await;
        let mut config = test_config(&provider.uri());
        customize(&mut config);

        let store = Arc::new(InMemoryStore::new());
        let app = Application::build_with_stores(config, store.clone(), store.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let tracker = app.state().tracker.clone();
        let address = format!("http://127.0.0.1:{}", port);

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_with_shutdown(async move {
            rx.await.ok();
        }));

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            provider,
            tracker,
            client,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn tenant_url(&self, tenant_id: uuid::Uuid, path: &str) -> String {
        format!("{}/v1/tenants/{}{}", self.address, tenant_id, path)
    }

    /// Trigger graceful shutdown and wait for the final flush.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server
                .await
                .expect("Server task panicked")
                .expect("Server returned an error");
        }
    }

    pub async fn post_webhook(&self, body: &[u8]) -> reqwest::Response {
        self.client
            .post(self.url("/webhooks/billing"))
            .header("Signature", signed_header(body, Utc::now().timestamp()))
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .expect("Failed to execute request")
    }
}

/// `t=..,v1=..` header for `body` signed with the test secret at `timestamp`.
pub fn signed_header(body: &[u8], timestamp: i64) -> String {
    let signature = generate_timestamped_signature(WEBHOOK_SECRET, timestamp, body)
        .expect("Failed to sign payload");
    format!("t={},v1={}", timestamp, signature)
}

pub fn event_body(event_type: &str, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    }))
    .expect("Failed to encode event")
}

/// Provider subscription object as returned by the REST API.
pub fn provider_subscription(id: &str, status: &str, price_id: &str) -> Value {
    let start = Utc::now().timestamp();
    json!({
        "id": id,
        "object": "subscription",
        "customer": "cus_test",
        "status": status,
        "current_period_start": start,
        "current_period_end": start + 30 * 24 * 3600,
        "cancel_at_period_end": false,
        "cancel_at": null,
        "canceled_at": null,
        "trial_start": null,
        "trial_end": null,
        "default_payment_method": "pm_card_visa",
        "metadata": {},
        "items": {
            "object": "list",
            "data": [
                { "id": format!("si_{}", id), "price": { "id": price_id, "lookup_key": null } }
            ]
        }
    })
}
