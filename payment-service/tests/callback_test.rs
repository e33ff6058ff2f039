mod common;

use common::{failure_callback, success_callback, TestApp, CALLBACK_TOKEN};
use payment_service::models::{GatewayResolution, PaymentAttempt, PaymentStatus};
use payment_service::services::settlement::{settle_attempt, Settlement};
use payment_service::services::OrderStore;
use serde_json::json;

/// Seed an order plus a live pending attempt, as initiation leaves them.
async fn seed_pending_attempt(app: &TestApp, order_id: &str, amount: u64, checkout_id: &str) {
    app.store
        .seed_order(order_id, amount as f64, PaymentStatus::Pending);
    app.store
        .record_attempt(PaymentAttempt::new(
            order_id.to_string(),
            "254712345678".to_string(),
            amount,
            order_id.to_string(),
            checkout_id.to_string(),
            None,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn success_callback_marks_order_paid() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let response = app
        .post_callback(CALLBACK_TOKEN, &success_callback("ws_1", 1501))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ResultCode"], 0);

    let attempt = app.store.attempt("ws_1").unwrap();
    assert_eq!(attempt.status, PaymentStatus::Paid);
    assert_eq!(attempt.receipt_number.as_deref(), Some("NLJ7RT61SV"));
    assert_eq!(attempt.transaction_date, Some(20191219102115));

    let order = app.store.order("abc").unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.mpesa_receipt_number.as_deref(), Some("NLJ7RT61SV"));
    assert!(order.paid_at.is_some());
}

#[tokio::test]
async fn failure_callback_marks_order_failed() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let response = app
        .post_callback(CALLBACK_TOKEN, &failure_callback("ws_1"))
        .await;

    assert_eq!(response.status().as_u16(), 200);

    let attempt = app.store.attempt("ws_1").unwrap();
    assert_eq!(attempt.status, PaymentStatus::Failed);
    assert_eq!(attempt.result_code, Some(1032));
    assert_eq!(
        attempt.result_desc.as_deref(),
        Some("Request cancelled by user.")
    );

    let order = app.store.order("abc").unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Failed);
}

#[tokio::test]
async fn unknown_correlation_id_is_acknowledged_without_mutation() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let response = app
        .post_callback(CALLBACK_TOKEN, &success_callback("ws_unknown", 1501))
        .await;

    assert_eq!(response.status().as_u16(), 200);

    // Nothing changed anywhere.
    assert_eq!(
        app.store.attempt("ws_1").unwrap().status,
        PaymentStatus::Pending
    );
    assert_eq!(
        app.store.order("abc").unwrap().payment_status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn duplicate_callback_is_a_no_op() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let first = app
        .post_callback(CALLBACK_TOKEN, &success_callback("ws_1", 1501))
        .await;
    assert_eq!(first.status().as_u16(), 200);

    // Redelivery carries a different verdict; it must not stick.
    let redelivery = failure_callback("ws_1");
    let second = app.post_callback(CALLBACK_TOKEN, &redelivery).await;
    assert_eq!(second.status().as_u16(), 200);

    let attempt = app.store.attempt("ws_1").unwrap();
    assert_eq!(attempt.status, PaymentStatus::Paid);
    assert_eq!(attempt.receipt_number.as_deref(), Some("NLJ7RT61SV"));

    let order = app.store.order("abc").unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn amount_mismatch_goes_to_manual_review() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let response = app
        .post_callback(CALLBACK_TOKEN, &success_callback("ws_1", 1500))
        .await;

    assert_eq!(response.status().as_u16(), 200);

    let attempt = app.store.attempt("ws_1").unwrap();
    assert_eq!(attempt.status, PaymentStatus::UnderReview);

    let order = app.store.order("abc").unwrap();
    assert_eq!(order.payment_status, PaymentStatus::UnderReview);
    assert_ne!(order.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn invalid_callback_token_is_unauthorized() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let response = app
        .post_callback("wrong-token", &success_callback("ws_1", 1501))
        .await;

    assert_eq!(response.status().as_u16(), 401);
    assert_eq!(
        app.store.attempt("ws_1").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn malformed_payload_is_still_acknowledged() {
    let app = TestApp::spawn().await;

    let response = app
        .api_client
        .post(format!(
            "{}/payments/mpesa/callback/{}",
            app.address, CALLBACK_TOKEN
        ))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);

    // Structurally valid JSON missing the envelope is treated the same.
    let response = app
        .post_callback(CALLBACK_TOKEN, &json!({ "Body": {} }))
        .await;
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn concurrent_deliveries_settle_exactly_once() {
    let app = TestApp::spawn().await;
    seed_pending_attempt(&app, "abc", 1501, "ws_1").await;

    let attempt = app.store.attempt("ws_1").unwrap();
    let resolution = GatewayResolution {
        result_code: 0,
        result_desc: "The service request is processed successfully.".to_string(),
        receipt_number: Some("NLJ7RT61SV".to_string()),
        transaction_date: Some(20191219102115),
        confirmed_amount: Some(1501),
        confirmed_msisdn: Some("254712345678".to_string()),
    };

    let store = app.store.clone();
    let (first, second) = tokio::join!(
        settle_attempt(store.as_ref(), &attempt, &resolution),
        settle_attempt(store.as_ref(), &attempt, &resolution),
    );

    let results = [first.unwrap(), second.unwrap()];
    let applied = results
        .iter()
        .filter(|s| matches!(s, Settlement::Applied(PaymentStatus::Paid)))
        .count();
    let no_ops = results
        .iter()
        .filter(|s| **s == Settlement::AlreadyTerminal)
        .count();

    assert_eq!(applied, 1);
    assert_eq!(no_ops, 1);
    assert_eq!(
        app.store.order("abc").unwrap().payment_status,
        PaymentStatus::Paid
    );
}
