//! Outcome settlement.
//!
//! Both delivery paths for a gateway verdict — the callback receiver and
//! the reconciliation sweeper — funnel through here, so the cross-checks
//! and the single CAS transition are applied identically no matter which
//! path reports first.

use crate::models::{AttemptOutcome, GatewayResolution, PaymentAttempt, PaymentStatus};
use crate::services::store::OrderStore;
use service_core::error::AppError;
use service_core::retry::{retry_async, RetryConfig};

/// What settling an attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// This call won the transition out of `Pending`.
    Applied(PaymentStatus),
    /// The attempt was already terminal; duplicate delivery, no-op.
    AlreadyTerminal,
}

/// Derive the terminal state from a raw gateway resolution.
///
/// A success verdict whose amount disagrees with what was charged goes to
/// manual review instead of `Paid`. A differing payer number is only
/// logged; customers legitimately pay from another line.
pub fn outcome_for(attempt: &PaymentAttempt, resolution: &GatewayResolution) -> AttemptOutcome {
    if resolution.result_code != 0 {
        return AttemptOutcome {
            status: PaymentStatus::Failed,
            result_code: resolution.result_code,
            result_desc: resolution.result_desc.clone(),
            receipt_number: None,
            transaction_date: resolution.transaction_date,
        };
    }

    if let Some(confirmed) = resolution.confirmed_amount {
        if confirmed != attempt.amount {
            tracing::warn!(
                order_id = %attempt.order_id,
                checkout_request_id = %attempt.checkout_request_id,
                charged = attempt.amount,
                confirmed,
                "confirmed amount differs from charged amount, flagging for review"
            );
            return AttemptOutcome {
                status: PaymentStatus::UnderReview,
                result_code: resolution.result_code,
                result_desc: format!(
                    "amount mismatch: charged {} confirmed {} ({})",
                    attempt.amount, confirmed, resolution.result_desc
                ),
                receipt_number: resolution.receipt_number.clone(),
                transaction_date: resolution.transaction_date,
            };
        }
    }

    if let Some(ref confirmed_msisdn) = resolution.confirmed_msisdn {
        if confirmed_msisdn != &attempt.msisdn {
            tracing::warn!(
                order_id = %attempt.order_id,
                checkout_request_id = %attempt.checkout_request_id,
                "callback phone number differs from the prompted number"
            );
        }
    }

    AttemptOutcome {
        status: PaymentStatus::Paid,
        result_code: resolution.result_code,
        result_desc: resolution.result_desc.clone(),
        receipt_number: resolution.receipt_number.clone(),
        transaction_date: resolution.transaction_date,
    }
}

/// Apply a gateway resolution to the attempt and its order.
///
/// Store hiccups are retried a bounded number of times; a lost CAS is a
/// duplicate delivery and reported as [`Settlement::AlreadyTerminal`].
pub async fn settle_attempt(
    store: &dyn OrderStore,
    attempt: &PaymentAttempt,
    resolution: &GatewayResolution,
) -> Result<Settlement, AppError> {
    let outcome = outcome_for(attempt, resolution);
    let retry = RetryConfig::quick();

    let resolved = retry_async(
        &retry,
        "resolve_attempt",
        AppError::is_transient,
        || store.resolve_attempt(&attempt.checkout_request_id, &outcome),
    )
    .await?;

    let Some(resolved) = resolved else {
        return Ok(Settlement::AlreadyTerminal);
    };

    retry_async(
        &retry,
        "apply_order_payment",
        AppError::is_transient,
        || store.apply_order_payment(&resolved.order_id, &outcome),
    )
    .await?;

    tracing::info!(
        order_id = %resolved.order_id,
        checkout_request_id = %attempt.checkout_request_id,
        status = ?outcome.status,
        result_code = outcome.result_code,
        "payment attempt settled"
    );

    Ok(Settlement::Applied(outcome.status))
}
