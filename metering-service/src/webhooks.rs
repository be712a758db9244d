//! Signed provider notifications: verify, parse, dispatch.
//!
//! The HTTP layer acknowledges every structurally valid, signed event with a
//! 200 regardless of the dispatch result. Dispatch failures come back as a
//! typed [`WebhookError::Dispatch`] carrying the event id and type.

use crate::config::WebhookConfig;
use crate::models::SyncOutcome;
use crate::services::SubscriptionService;
use chrono::Utc;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use service_core::error::AppError;
use service_core::utils::{verify_timestamped_signature, SignatureError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl WebhookEvent {
    /// Provider subscription id referenced by the event, if any.
    ///
    /// Subscription events carry it as the object id, invoice events in the
    /// `subscription` field.
    pub fn subscription_id(&self) -> Option<&str> {
        let field = if self.event_type.starts_with("customer.subscription.") {
            "id"
        } else {
            "subscription"
        };
        self.data
            .object
            .get(field)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Synced {
        subscription_id: String,
        outcome: SyncOutcome,
    },
    Logged,
    Ignored,
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Synced { .. } => "synced",
            WebhookOutcome::Logged => "logged",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("empty request body")]
    EmptyBody,

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("failed to handle {event_type} event {event_id}: {source}")]
    Dispatch {
        event_id: String,
        event_type: String,
        #[source]
        source: AppError,
    },
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Signature(ref e) if !e.is_malformed() => {
                AppError::Unauthorized(anyhow::anyhow!(err.to_string()))
            }
            WebhookError::Dispatch { source, .. } => source,
            other => AppError::BadRequest(anyhow::anyhow!(other.to_string())),
        }
    }
}

const SYNC_EVENTS: &[&str] = &[
    "customer.subscription.created",
    "customer.subscription.updated",
    "customer.subscription.deleted",
    "invoice.payment_succeeded",
    "invoice.payment_failed",
];

const LOGGED_EVENTS: &[&str] = &[
    "customer.subscription.trial_will_end",
    "invoice.finalized",
    "customer.updated",
    "payment_method.attached",
    "payment_method.detached",
];

pub struct WebhookProcessor {
    secret: Secret<String>,
    tolerance_secs: i64,
    subscriptions: Arc<SubscriptionService>,
}

impl WebhookProcessor {
    pub fn new(config: &WebhookConfig, subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            secret: config.secret.clone(),
            tolerance_secs: config.tolerance_secs,
            subscriptions,
        }
    }

    pub fn verification_enabled(&self) -> bool {
        !self.secret.expose_secret().is_empty()
    }

    /// Check the body against the signature header. Always passes when no
    /// secret is configured.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<(), WebhookError> {
        if !self.verification_enabled() {
            return Ok(());
        }
        let header = signature
            .filter(|h| !h.trim().is_empty())
            .ok_or(WebhookError::MissingSignature)?;

        verify_timestamped_signature(
            self.secret.expose_secret(),
            header,
            body,
            Utc::now().timestamp(),
            self.tolerance_secs,
        )?;
        Ok(())
    }

    pub fn parse(&self, body: &[u8]) -> Result<WebhookEvent, WebhookError> {
        if body.is_empty() {
            return Err(WebhookError::EmptyBody);
        }
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }

    /// Verify and parse in one step; nothing is mutated before this succeeds.
    pub fn accept(&self, signature: Option<&str>, body: &[u8]) -> Result<WebhookEvent, WebhookError> {
        if body.is_empty() {
            return Err(WebhookError::EmptyBody);
        }
        self.verify(signature, body)?;
        self.parse(body)
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<WebhookOutcome, WebhookError> {
        let event_type = event.event_type.as_str();

        if SYNC_EVENTS.contains(&event_type) {
            let Some(subscription_id) = event.subscription_id() else {
                debug!("Event carries no subscription id");
                return Ok(WebhookOutcome::Ignored);
            };
            let outcome = self
                .subscriptions
                .sync_from_provider(subscription_id)
                .await
                .map_err(|source| WebhookError::Dispatch {
                    event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    source,
                })?;
            return Ok(WebhookOutcome::Synced {
                subscription_id: subscription_id.to_string(),
                outcome,
            });
        }

        if LOGGED_EVENTS.contains(&event_type) {
            let object_id = event.data.object.get("id").and_then(Value::as_str);
            info!(object_id, "Billing event received");
            return Ok(WebhookOutcome::Logged);
        }

        debug!("Unhandled billing event type");
        Ok(WebhookOutcome::Ignored)
    }
}
