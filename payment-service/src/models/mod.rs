use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment state of an attempt (and mirrored onto its order).
///
/// An attempt leaves `Pending` exactly once; every other state is terminal
/// for the idempotency contract. `UnderReview` marks a success callback
/// whose amount did not match what was charged — never silently `Paid`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    UnderReview,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Metric/label form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::UnderReview => "under_review",
        }
    }
}

/// One attempt to collect payment for an order.
///
/// `checkout_request_id` is the gateway-issued correlation id — the only
/// handle a later callback carries. It is persisted before the initiation
/// response is returned.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentAttempt {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub order_id: String,
    pub msisdn: String,
    /// Whole KES charged (ceiling of the requested amount).
    pub amount: u64,
    pub account_reference: String,
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub status: PaymentStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    /// Gateway-format transaction timestamp (YYYYMMDDHHMMSS).
    pub transaction_date: Option<i64>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl PaymentAttempt {
    pub fn new(
        order_id: String,
        msisdn: String,
        amount: u64,
        account_reference: String,
        checkout_request_id: String,
        merchant_request_id: Option<String>,
    ) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            msisdn,
            amount,
            account_reference,
            checkout_request_id,
            merchant_request_id,
            status: PaymentStatus::Pending,
            result_code: None,
            result_desc: None,
            receipt_number: None,
            transaction_date: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The externally-owned order, reduced to the fields this service reads
/// and the payment fields it writes back.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub total_amount: f64,
    pub payment_status: PaymentStatus,
    pub mpesa_receipt_number: Option<String>,
    pub paid_at: Option<DateTime>,
    /// Audit note (failure description, review reason).
    pub payment_note: Option<String>,
}

/// A gateway-reported outcome, before cross-checks.
///
/// Produced from a callback or from a reconciliation status query; the
/// query path carries no metadata, so everything beyond the result code is
/// optional.
#[derive(Debug, Clone)]
pub struct GatewayResolution {
    pub result_code: i64,
    pub result_desc: String,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<i64>,
    pub confirmed_amount: Option<u64>,
    pub confirmed_msisdn: Option<String>,
}

/// The terminal state to write through the store CAS, derived from a
/// [`GatewayResolution`] after cross-checks.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status: PaymentStatus,
    pub result_code: i64,
    pub result_desc: String,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<i64>,
}
