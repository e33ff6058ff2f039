#![allow(dead_code)]

use async_trait::async_trait;
use mongodb::bson::DateTime;
use payment_service::config::{
    Config, DarajaConfig, DatabaseConfig, ReconciliationConfig, ServerConfig,
};
use payment_service::models::{AttemptOutcome, Order, PaymentAttempt, PaymentStatus};
use payment_service::services::{DarajaClient, OrderStore};
use payment_service::{app_router, AppState};
use secrecy::Secret;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CALLBACK_TOKEN: &str = "test-cb-token";
pub const CHECKOUT_REQUEST_ID: &str = "ws_CO_191220191020363925";

/// In-memory stand-in for the externally-owned order store, with the same
/// compare-and-set semantics as the Mongo implementation.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Mutex<HashMap<String, Order>>,
    attempts: Mutex<Vec<PaymentAttempt>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_order(&self, id: &str, total_amount: f64, payment_status: PaymentStatus) {
        self.orders.lock().unwrap().insert(
            id.to_string(),
            Order {
                id: id.to_string(),
                total_amount,
                payment_status,
                mpesa_receipt_number: None,
                paid_at: None,
                payment_note: None,
            },
        );
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders.lock().unwrap().get(id).cloned()
    }

    pub fn attempts_for_order(&self, order_id: &str) -> Vec<PaymentAttempt> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn attempt(&self, checkout_request_id: &str) -> Option<PaymentAttempt> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.checkout_request_id == checkout_request_id)
            .cloned()
    }

    /// Backdate an attempt so the reconciliation sweeper picks it up.
    pub fn age_attempt(&self, checkout_request_id: &str, seconds: i64) {
        let mut attempts = self.attempts.lock().unwrap();
        if let Some(attempt) = attempts
            .iter_mut()
            .find(|a| a.checkout_request_id == checkout_request_id)
        {
            attempt.created_at =
                DateTime::from_millis(attempt.created_at.timestamp_millis() - seconds * 1000);
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        Ok(self.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn record_attempt(&self, attempt: PaymentAttempt) -> Result<(), AppError> {
        self.attempts.lock().unwrap().push(attempt);
        Ok(())
    }

    async fn attempt_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        Ok(self.attempt(checkout_request_id))
    }

    async fn pending_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.order_id == order_id && a.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn latest_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.order_id == order_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn resolve_attempt(
        &self,
        checkout_request_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let mut attempts = self.attempts.lock().unwrap();
        let Some(attempt) = attempts
            .iter_mut()
            .find(|a| a.checkout_request_id == checkout_request_id)
        else {
            return Ok(None);
        };

        if attempt.status != PaymentStatus::Pending {
            return Ok(None);
        }

        attempt.status = outcome.status;
        attempt.result_code = Some(outcome.result_code);
        attempt.result_desc = Some(outcome.result_desc.clone());
        attempt.receipt_number = outcome.receipt_number.clone();
        attempt.transaction_date = outcome.transaction_date;
        attempt.updated_at = DateTime::now();

        Ok(Some(attempt.clone()))
    }

    async fn apply_order_payment(
        &self,
        order_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<(), AppError> {
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(());
        };

        let writable = match outcome.status {
            PaymentStatus::Failed => order.payment_status == PaymentStatus::Pending,
            _ => order.payment_status != PaymentStatus::Paid,
        };
        if !writable {
            return Ok(());
        }

        order.payment_status = outcome.status;
        order.payment_note = Some(outcome.result_desc.clone());
        if outcome.status == PaymentStatus::Paid {
            order.mpesa_receipt_number = outcome.receipt_number.clone();
            order.paid_at = Some(DateTime::now());
        }

        Ok(())
    }

    async fn mark_order_pending(&self, order_id: &str) -> Result<(), AppError> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(order_id) {
            if order.payment_status != PaymentStatus::Paid {
                order.payment_status = PaymentStatus::Pending;
            }
        }
        Ok(())
    }

    async fn pending_attempts_older_than(
        &self,
        cutoff: DateTime,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.status == PaymentStatus::Pending && a.created_at < cutoff)
            .cloned()
            .collect())
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<InMemoryOrderStore>,
    pub gateway: MockServer,
    pub config: Config,
    pub api_client: reqwest::Client,
}

pub fn test_config(gateway_url: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            url: Secret::new("mongodb://localhost:27017".to_string()),
            db_name: "payment_test".to_string(),
        },
        daraja: DarajaConfig {
            api_base_url: gateway_url.to_string(),
            consumer_key: "test_key".to_string(),
            consumer_secret: Secret::new("test_secret".to_string()),
            shortcode: "174379".to_string(),
            passkey: Secret::new("test_passkey".to_string()),
            callback_base_url: "https://shop.example.com".to_string(),
            callback_token: Secret::new(CALLBACK_TOKEN.to_string()),
            http_timeout_secs: 2,
        },
        reconciliation: ReconciliationConfig {
            enabled: false,
            interval_secs: 60,
            pending_deadline_secs: 300,
        },
        service_name: "payment-service-test".to_string(),
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        let gateway = MockServer::start().await;
        let config = test_config(&gateway.uri());

        let store = Arc::new(InMemoryOrderStore::new());
        let daraja =
            DarajaClient::new(config.daraja.clone()).expect("failed to build gateway client");

        let state = AppState {
            config: config.clone(),
            store: store.clone() as Arc<dyn OrderStore>,
            daraja,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let port = listener.local_addr().unwrap().port();
        let router = app_router(state);

        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let api_client = reqwest::Client::new();
        let address = format!("http://127.0.0.1:{}", port);

        // Wait for the server to come up.
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if api_client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            store,
            gateway,
            config,
            api_client,
        }
    }

    /// Mount the gateway's happy-path token and push responses.
    pub async fn mount_gateway_accepts_push(&self) {
        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "test_token",
                "expires_in": "3599"
            })))
            .mount(&self.gateway)
            .await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": CHECKOUT_REQUEST_ID,
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "CustomerMessage": "Success. Request accepted for processing"
            })))
            .mount(&self.gateway)
            .await;
    }

    pub async fn post_stk_push(&self, body: serde_json::Value) -> reqwest::Response {
        self.api_client
            .post(format!("{}/payments/stk-push", self.address))
            .json(&body)
            .send()
            .await
            .expect("failed to execute stk-push request")
    }

    pub async fn post_callback(&self, token: &str, body: &serde_json::Value) -> reqwest::Response {
        self.api_client
            .post(format!("{}/payments/mpesa/callback/{}", self.address, token))
            .json(body)
            .send()
            .await
            .expect("failed to execute callback request")
    }

    pub async fn get_order_payment(&self, order_id: &str) -> reqwest::Response {
        self.api_client
            .get(format!("{}/payments/orders/{}", self.address, order_id))
            .send()
            .await
            .expect("failed to execute order payment request")
    }
}

/// A success callback body for the given correlation id.
pub fn success_callback(checkout_request_id: &str, amount: u64) -> serde_json::Value {
    serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "TransactionDate", "Value": 20191219102115i64 },
                        { "Name": "PhoneNumber", "Value": 254712345678i64 }
                    ]
                }
            }
        }
    })
}

/// A failure callback body (customer cancelled).
pub fn failure_callback(checkout_request_id: &str) -> serde_json::Value {
    serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user."
            }
        }
    })
}
