use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::PaymentStatus;

/// Request to start an STK push for an order.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StkPushRequest {
    #[validate(length(min = 1, max = 128))]
    pub order_id: String,
    #[validate(length(min = 9, max = 20))]
    pub phone_number: String,
    /// Requested amount; transmitted as its ceiling in whole KES.
    pub amount: f64,
    /// Echoed back by the gateway; defaults to the order id.
    pub account_reference: Option<String>,
}

/// Acceptance response: the push was submitted and the correlation id
/// persisted. The final outcome arrives via callback.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StkPushResponse {
    pub attempt_id: Uuid,
    pub order_id: String,
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

/// Payment state of an order, for storefront polling.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentResponse {
    pub order_id: String,
    pub payment_status: PaymentStatus,
    pub receipt_number: Option<String>,
    pub result_desc: Option<String>,
    /// Whole-KES amount of the latest attempt, if any.
    pub amount: Option<u64>,
}

/// Inbound callback envelope, exactly as the gateway ships it:
/// `{ Body: { stkCallback: { ... } } }`.
#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<MetadataItem>,
}

/// Name/value pairs; values are strings or numbers depending on the field.
#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    fn metadata_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    /// String form of a metadata field (numbers are stringified, which is
    /// how the gateway ships phone numbers).
    pub fn metadata_str(&self, name: &str) -> Option<String> {
        match self.metadata_value(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn metadata_u64(&self, name: &str) -> Option<u64> {
        let value = self.metadata_value(name)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().map(|f| f.round() as u64))
    }

    pub fn metadata_i64(&self, name: &str) -> Option<i64> {
        let value = self.metadata_value(name)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
    }
}
