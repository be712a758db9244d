//! Billing provider HTTP client tests against a mock server.

mod common;

use metering_service::config::ProviderConfig;
use metering_service::services::provider::{
    BillingProvider, ItemPrice, NewCheckoutSession, NewCustomer, NewUsageReport, ProviderError,
    SubscriptionUpdate, UsageAction,
};
use metering_service::services::StripeProvider;
use secrecy::Secret;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{
    basic_auth, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, key: &str) -> StripeProvider {
    StripeProvider::new(ProviderConfig {
        base_url: server.uri(),
        secret_key: Secret::new(key.to_string()),
        timeout: Duration::from_secs(5),
    })
    .expect("Failed to build provider client")
}

#[tokio::test]
async fn sends_pinned_version_and_basic_auth() {
    let server = MockServer::start().await;
    let tenant = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .and(header("Stripe-Version", "2023-10-16"))
        .and(basic_auth("sk_test_abc", ""))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains(format!(
            "metadata%5Btenant_id%5D={}",
            tenant
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_42",
            "email": "a@b.test",
            "name": "A",
            "metadata": { "tenant_id": tenant.to_string() }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let customer = client(&server, "sk_test_abc")
        .create_customer(&NewCustomer {
            tenant_id: tenant,
            email: "a@b.test".into(),
            name: "A".into(),
        })
        .await
        .unwrap();

    assert_eq!(customer.id, "cus_42");
}

#[tokio::test]
async fn usage_records_carry_idempotency_key() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/subscription_items/si_runs/usage_records"))
        .and(header("Idempotency-Key", "usage-abc"))
        .and(body_string_contains("quantity=12"))
        .and(body_string_contains("action=increment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "mbur_1",
            "quantity": 12,
            "subscription_item": "si_runs"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let record = client(&server, "sk_test_abc")
        .create_usage_record(&NewUsageReport {
            subscription_item_id: "si_runs".into(),
            quantity: 12,
            timestamp: 1_700_000_000,
            action: UsageAction::Increment,
            idempotency_key: Some("usage-abc".into()),
        })
        .await
        .unwrap();

    assert_eq!(record.id, "mbur_1");
}

#[tokio::test]
async fn immediate_cancel_uses_delete() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/subscriptions/sub_1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::provider_subscription(
                "sub_1", "canceled", "price_x",
            )),
        )
        .expect(1)
        .mount(&server)
        .await;

    let canceled = client(&server, "sk_test_abc")
        .cancel_subscription("sub_1", false)
        .await
        .unwrap();

    assert_eq!(canceled.status, "canceled");
    assert_eq!(canceled.primary_price_id(), Some("price_x"));
}

#[tokio::test]
async fn decodes_error_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/subscriptions/sub_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "message": "No such subscription: 'sub_missing'"
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server, "sk_test_abc")
        .get_subscription("sub_missing")
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    match err {
        ProviderError::Api {
            status,
            message,
            kind,
        } => {
            assert_eq!(status, 404);
            assert!(message.contains("sub_missing"));
            assert_eq!(kind.as_deref(), Some("invalid_request_error"));
        }
        other => panic!("expected API error, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_key_fails_without_calling_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = client(&server, "");
    assert!(!provider.is_configured());
    assert!(matches!(
        provider.get_customer("cus_1").await,
        Err(ProviderError::NotConfigured)
    ));
}

#[tokio::test]
async fn update_swaps_item_price_with_form_post() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/subscriptions/sub_1"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("items%5B0%5D%5Bid%5D=si_base"))
        .and(body_string_contains("items%5B0%5D%5Bprice%5D=price_ent"))
        .and(body_string_contains("proration_behavior=create_prorations"))
        .and(body_string_contains("metadata%5Bplan%5D=enterprise"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_1",
            "status": "active",
            "items": { "data": [ { "id": "si_base", "price": { "id": "price_ent" } } ] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let updated = client(&server, "sk_test_abc")
        .update_subscription(
            "sub_1",
            &SubscriptionUpdate {
                item_price: Some(ItemPrice {
                    item_id: "si_base".into(),
                    price_id: "price_ent".into(),
                }),
                proration_behavior: Some("create_prorations".into()),
                metadata: vec![("plan".into(), "enterprise".into())],
                ..SubscriptionUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.primary_price_id(), Some("price_ent"));
}

#[tokio::test]
async fn checkout_session_posts_line_item_and_customer() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .and(body_string_contains("mode=subscription"))
        .and(body_string_contains("line_items%5B0%5D%5Bprice%5D=price_pro"))
        .and(body_string_contains("customer=cus_1"))
        .and(body_string_contains("metadata%5Btenant_id%5D=tenant-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_1",
            "url": "https://checkout.example.test/cs_1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = client(&server, "sk_test_abc")
        .create_checkout_session(&NewCheckoutSession {
            price_id: "price_pro".into(),
            success_url: "https://app.example.test/ok".into(),
            cancel_url: "https://app.example.test/cancel".into(),
            customer_id: Some("cus_1".into()),
            customer_email: None,
            metadata: vec![("tenant_id".into(), "tenant-1".into())],
        })
        .await
        .unwrap();

    assert_eq!(session.url, "https://checkout.example.test/cs_1");
}

#[tokio::test]
async fn invoices_are_read_with_query_parameters() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/invoices/upcoming"))
        .and(query_param("customer", "cus_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "customer": "cus_1",
            "currency": "usd",
            "amount_due": 9900
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/invoices"))
        .and(query_param("customer", "cus_1"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                { "id": "in_2", "amount_paid": 9900, "paid": true },
                { "id": "in_1", "amount_paid": 9900, "paid": true }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = client(&server, "sk_test_abc");
    let upcoming = provider.upcoming_invoice("cus_1").await.unwrap();
    assert_eq!(upcoming.amount_due, 9_900);
    assert!(upcoming.id.is_none());

    let invoices = provider.list_invoices("cus_1", 2).await.unwrap();
    assert_eq!(invoices.len(), 2);
    assert_eq!(invoices[0].id.as_deref(), Some("in_2"));
}
