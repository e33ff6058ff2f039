//! M-Pesa Daraja gateway client.
//!
//! Covers the three wire interactions: the Basic-auth credential exchange,
//! STK push submission, and the status query used by reconciliation. The
//! push response only acknowledges acceptance; the real outcome arrives
//! later on the callback endpoint.

use crate::config::DarajaConfig;
use anyhow::anyhow;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tokens are considered stale this long before their advertised expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Gateway error code meaning "the transaction is still being processed".
const QUERY_STILL_PROCESSING: &str = "500.001.1001";

/// Daraja client. Cheap to clone; the token cache is shared.
#[derive(Clone)]
pub struct DarajaClient {
    client: Client,
    config: DarajaConfig,
    token_cache: Arc<DashMap<String, CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Acceptance acknowledgment from a push submission.
///
/// `checkout_request_id` is the correlation id; it must be persisted
/// against the order before initiation returns.
#[derive(Debug, Clone)]
pub struct StkPushAck {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
}

/// Result of a reconciliation status query.
#[derive(Debug, Clone)]
pub enum StkQueryOutcome {
    /// The gateway has a final verdict for the push.
    Complete { result_code: i64, result_desc: String },
    /// The customer has not acted yet; try again later.
    Processing,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    /// The gateway ships this as a string ("3599"); tolerate numbers too.
    expires_in: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StkPushPayload<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: &'static str,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    #[serde(rename = "PhoneNumber")]
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: &'a str,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponseBody {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct StkQueryPayload<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponseBody {
    #[serde(rename = "ResultCode")]
    result_code: Option<serde_json::Value>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AppError::Config(anyhow!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            token_cache: Arc::new(DashMap::new()),
        })
    }

    /// Fetch a bearer token, reusing a cached one until shortly before its
    /// advertised expiry. Caching is an optimization only; a cache miss is
    /// just another round-trip.
    pub async fn access_token(&self) -> Result<String, AppError> {
        if let Some(cached) = self.token_cache.get(&self.config.consumer_key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.api_base_url
        );

        let response = self
            .client
            .get(&url)
            .basic_auth(
                &self.config.consumer_key,
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| AppError::Credential(anyhow!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Credential(anyhow!("token response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(AppError::Credential(anyhow!(
                "token endpoint returned {status}"
            )));
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Credential(anyhow!("token response not JSON: {e}")))?;

        let token = token_response
            .access_token
            .ok_or_else(|| AppError::Credential(anyhow!("token response missing access_token")))?;

        let expires_in = token_response
            .expires_in
            .as_ref()
            .and_then(parse_expires_in)
            .unwrap_or(3600);

        let ttl = Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.token_cache.insert(
            self.config.consumer_key.clone(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        tracing::debug!(expires_in, "gateway access token refreshed");

        Ok(token)
    }

    /// Submit an STK push. The returned acknowledgment carries the
    /// correlation id; the payment outcome itself arrives asynchronously.
    pub async fn stk_push(
        &self,
        msisdn: &str,
        amount: u64,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushAck, AppError> {
        let token = self.access_token().await?;
        let timestamp = gateway_timestamp(Utc::now());
        let password = stk_password(
            &self.config.shortcode,
            self.config.passkey.expose_secret(),
            &timestamp,
        );

        let payload = StkPushPayload {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: msisdn,
            party_b: &self.config.shortcode,
            phone_number: msisdn,
            call_back_url: self.config.callback_url(),
            account_reference,
            transaction_desc: description.to_string(),
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        tracing::debug!(status = %status, "gateway push response");

        if status.as_u16() == 401 {
            // Stale cached token; drop it so the next attempt re-fetches.
            self.token_cache.remove(&self.config.consumer_key);
            return Err(AppError::Credential(anyhow!(
                "gateway rejected bearer token"
            )));
        }

        if status.is_server_error() {
            return Err(AppError::GatewayUnavailable(anyhow!(
                "gateway returned {status}"
            )));
        }

        let parsed: StkPushResponseBody = serde_json::from_str(&body)
            .map_err(|e| AppError::Protocol(anyhow!("push response not JSON: {e}")))?;

        if !status.is_success() {
            return Err(AppError::Protocol(anyhow!(
                "gateway rejected push request: {status} {}",
                parsed.response_description.unwrap_or_else(|| body.clone())
            )));
        }

        match parsed.response_code.as_deref() {
            Some("0") => {}
            other => {
                return Err(AppError::Protocol(anyhow!(
                    "gateway did not accept push: code {:?} {}",
                    other,
                    parsed.response_description.unwrap_or_default()
                )));
            }
        }

        let checkout_request_id = parsed.checkout_request_id.ok_or_else(|| {
            AppError::Protocol(anyhow!("push response missing CheckoutRequestID"))
        })?;

        tracing::info!(
            checkout_request_id = %checkout_request_id,
            amount,
            "STK push accepted by gateway"
        );

        Ok(StkPushAck {
            checkout_request_id,
            merchant_request_id: parsed.merchant_request_id,
            customer_message: parsed.customer_message,
        })
    }

    /// Ask the gateway for the outcome of a previously accepted push.
    ///
    /// Used by the reconciliation sweeper for attempts whose callback never
    /// arrived (or was lost).
    pub async fn query_stk_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<StkQueryOutcome, AppError> {
        let token = self.access_token().await?;
        let timestamp = gateway_timestamp(Utc::now());
        let password = stk_password(
            &self.config.shortcode,
            self.config.passkey.expose_secret(),
            &timestamp,
        );

        let payload = StkQueryPayload {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            checkout_request_id,
        };

        let url = format!("{}/mpesa/stkpushquery/v1/query", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        let parsed: StkQueryResponseBody = serde_json::from_str(&body)
            .map_err(|e| AppError::Protocol(anyhow!("query response not JSON: {e}")))?;

        if parsed.error_code.as_deref() == Some(QUERY_STILL_PROCESSING) {
            return Ok(StkQueryOutcome::Processing);
        }

        if !status.is_success() {
            return Err(AppError::Protocol(anyhow!(
                "status query failed: {status} {}",
                parsed.error_message.unwrap_or_else(|| body.clone())
            )));
        }

        // ResultCode arrives as a string on this endpoint.
        let result_code = parsed
            .result_code
            .as_ref()
            .and_then(|v| match v {
                serde_json::Value::String(s) => s.parse::<i64>().ok(),
                serde_json::Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .ok_or_else(|| AppError::Protocol(anyhow!("query response missing ResultCode")))?;

        Ok(StkQueryOutcome::Complete {
            result_code,
            result_desc: parsed.result_desc.unwrap_or_default(),
        })
    }
}

fn parse_expires_in(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn map_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::GatewayUnavailable(anyhow!("gateway timed out: {err}"))
    } else {
        AppError::GatewayUnavailable(anyhow!("gateway unreachable: {err}"))
    }
}

/// Gateway timestamp format: YYYYMMDDHHMMSS, UTC.
pub fn gateway_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Per-request password: base64(shortcode + passkey + timestamp).
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    general_purpose::STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}
