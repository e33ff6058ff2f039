//! Gateway callback receiver.
//!
//! The gateway delivers push outcomes here, arbitrarily later and with no
//! ordering or single-delivery guarantee. Policy: once the sender is
//! authenticated, acknowledge with 200 no matter what happened internally —
//! a non-2xx only provokes redelivery storms without fixing anything.

use axum::{
    extract::{Path, State},
    Json,
};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use service_core::error::AppError;
use service_core::retry::{retry_until_some, RetryConfig};
use service_core::utils::constant_time_eq;

use crate::{
    dtos::{CallbackEnvelope, StkCallback},
    models::GatewayResolution,
    services::metrics::record_callback,
    services::settlement::{settle_attempt, Settlement},
    AppState,
};

fn ack() -> Json<Value> {
    Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
}

impl GatewayResolution {
    /// Extract the resolution from a callback, pulling the success
    /// metadata items the gateway ships name/value style.
    pub fn from_callback(cb: &StkCallback) -> Self {
        Self {
            result_code: cb.result_code,
            result_desc: cb.result_desc.clone(),
            receipt_number: cb.metadata_str("MpesaReceiptNumber"),
            transaction_date: cb.metadata_i64("TransactionDate"),
            confirmed_amount: cb.metadata_u64("Amount"),
            confirmed_msisdn: cb.metadata_str("PhoneNumber"),
        }
    }
}

/// Receive an STK push outcome from the gateway.
///
/// The path token is the shared secret baked into every callback URL we
/// register; anything without it did not come from our push submissions.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: String,
) -> Result<Json<Value>, AppError> {
    if !constant_time_eq(&token, state.config.daraja.callback_token.expose_secret()) {
        tracing::warn!("callback rejected: invalid path token");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "invalid callback token"
        )));
    }

    // Body arrives as a raw string: a payload the gateway generated must
    // never bounce with a 4xx/5xx, however malformed.
    let envelope: CallbackEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "malformed gateway callback, acknowledging anyway");
            record_callback("malformed");
            return Ok(ack());
        }
    };
    let cb = envelope.body.stk_callback;

    tracing::info!(
        checkout_request_id = %cb.checkout_request_id,
        result_code = cb.result_code,
        "gateway callback received"
    );

    // The callback can beat the initiation write in pathological cases;
    // retry the lookup briefly before concluding the id is foreign.
    let attempt = match retry_until_some(
        &RetryConfig::quick(),
        "callback_correlation",
        || state.store.attempt_by_checkout_id(&cb.checkout_request_id),
    )
    .await
    {
        Ok(Some(attempt)) => attempt,
        Ok(None) => {
            tracing::warn!(
                checkout_request_id = %cb.checkout_request_id,
                "callback for unknown correlation id, ignoring"
            );
            record_callback("unknown_correlation");
            return Ok(ack());
        }
        Err(e) => {
            tracing::error!(
                checkout_request_id = %cb.checkout_request_id,
                error = %e,
                "correlation lookup failed, acknowledging anyway"
            );
            record_callback("store_error");
            return Ok(ack());
        }
    };

    let resolution = GatewayResolution::from_callback(&cb);

    match settle_attempt(state.store.as_ref(), &attempt, &resolution).await {
        Ok(Settlement::Applied(status)) => {
            record_callback(status.as_str());
        }
        Ok(Settlement::AlreadyTerminal) => {
            tracing::info!(
                checkout_request_id = %cb.checkout_request_id,
                "duplicate callback delivery, attempt already terminal"
            );
            record_callback("duplicate");
        }
        Err(e) => {
            tracing::error!(
                checkout_request_id = %cb.checkout_request_id,
                error = %e,
                "failed to settle callback, acknowledging anyway"
            );
            record_callback("store_error");
        }
    }

    Ok(ack())
}
