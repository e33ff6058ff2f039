//! Payment initiation and status handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::{OrderPaymentResponse, StkPushRequest, StkPushResponse},
    models::{PaymentAttempt, PaymentStatus},
    services::metrics::record_initiation,
    utils::{ceil_amount, normalize_msisdn},
    AppState,
};

/// Start an STK push for an order.
///
/// All validation happens before any network call. The gateway's
/// correlation id is persisted before the 202 goes out, so a callback can
/// never arrive for an attempt we have no record of.
pub async fn initiate_stk_push(
    State(state): State<AppState>,
    Json(payload): Json<StkPushRequest>,
) -> Result<(StatusCode, Json<StkPushResponse>), AppError> {
    payload.validate()?;

    let msisdn = normalize_msisdn(&payload.phone_number).map_err(AppError::BadRequest)?;
    let amount = ceil_amount(payload.amount).map_err(AppError::BadRequest)?;
    let account_reference = payload
        .account_reference
        .clone()
        .unwrap_or_else(|| payload.order_id.clone());

    tracing::info!(
        order_id = %payload.order_id,
        amount,
        "initiating STK push"
    );

    let order = state
        .store
        .get_order(&payload.order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order not found")))?;

    match order.payment_status {
        PaymentStatus::Paid => {
            return Err(AppError::Conflict(anyhow::anyhow!("Order is already paid")));
        }
        PaymentStatus::UnderReview => {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Order payment is under review"
            )));
        }
        PaymentStatus::Pending | PaymentStatus::Failed => {}
    }

    // A live pending push must be resolved (callback or reconciliation)
    // before another one may charge the same order.
    if let Some(existing) = state
        .store
        .pending_attempt_for_order(&payload.order_id)
        .await?
    {
        tracing::warn!(
            order_id = %payload.order_id,
            checkout_request_id = %existing.checkout_request_id,
            "rejecting initiation: payment already in progress"
        );
        return Err(AppError::Conflict(anyhow::anyhow!(
            "A payment for this order is already in progress"
        )));
    }

    let description = format!("Payment for order {}", payload.order_id);
    let ack = match state
        .daraja
        .stk_push(&msisdn, amount, &account_reference, &description)
        .await
    {
        Ok(ack) => ack,
        Err(e) => {
            record_initiation("gateway_error");
            return Err(e);
        }
    };

    let attempt = PaymentAttempt::new(
        payload.order_id.clone(),
        msisdn,
        amount,
        account_reference,
        ack.checkout_request_id.clone(),
        ack.merchant_request_id.clone(),
    );

    state.store.record_attempt(attempt.clone()).await?;
    state.store.mark_order_pending(&payload.order_id).await?;

    record_initiation("accepted");

    tracing::info!(
        order_id = %payload.order_id,
        attempt_id = %attempt.id,
        checkout_request_id = %ack.checkout_request_id,
        "STK push accepted, correlation persisted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(StkPushResponse {
            attempt_id: attempt.id,
            order_id: payload.order_id,
            checkout_request_id: ack.checkout_request_id,
            customer_message: ack.customer_message,
        }),
    ))
}

/// Payment state of an order, polled by the storefront's confirmation page.
pub async fn get_order_payment(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderPaymentResponse>, AppError> {
    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order not found")))?;

    let latest = state.store.latest_attempt_for_order(&order_id).await?;

    let receipt_number = order
        .mpesa_receipt_number
        .or_else(|| latest.as_ref().and_then(|a| a.receipt_number.clone()));
    let result_desc = latest.as_ref().and_then(|a| a.result_desc.clone());
    let amount = latest.as_ref().map(|a| a.amount);

    Ok(Json(OrderPaymentResponse {
        order_id,
        payment_status: order.payment_status,
        receipt_number,
        result_desc,
        amount,
    }))
}
