//! Order store access.
//!
//! The storefront platform owns orders; this service reads them and writes
//! payment fields back, and owns the payment-attempt records that carry
//! the gateway correlation ids. The terminal transition of an attempt is a
//! compare-and-set at the database layer so concurrent callback deliveries
//! cannot both apply.

use crate::models::{AttemptOutcome, Order, PaymentAttempt, PaymentStatus};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, DateTime};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOneOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Collection, Database, IndexModel};
use service_core::error::AppError;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, AppError>;

    /// Persist a fresh attempt (the correlation mapping). Must complete
    /// before initiation reports success to the caller.
    async fn record_attempt(&self, attempt: PaymentAttempt) -> Result<(), AppError>;

    async fn attempt_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    async fn pending_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    async fn latest_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    /// Atomically transition an attempt out of `Pending`.
    ///
    /// Returns the updated attempt when this call won the transition, or
    /// `None` when the attempt is unknown or already terminal (duplicate
    /// delivery) — the caller must treat that as a no-op, not an error.
    async fn resolve_attempt(
        &self,
        checkout_request_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    /// Write the outcome through to the order's payment fields. Guarded so
    /// a `Paid` order is never downgraded.
    async fn apply_order_payment(
        &self,
        order_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<(), AppError>;

    /// Reset a previously failed order back to `Pending` when a new
    /// attempt starts for it.
    async fn mark_order_pending(&self, order_id: &str) -> Result<(), AppError>;

    /// Attempts still pending since before `cutoff`, for reconciliation.
    async fn pending_attempts_older_than(
        &self,
        cutoff: DateTime,
    ) -> Result<Vec<PaymentAttempt>, AppError>;
}

/// MongoDB-backed store.
#[derive(Clone)]
pub struct MongoOrderStore {
    orders: Collection<Order>,
    attempts: Collection<PaymentAttempt>,
}

impl MongoOrderStore {
    pub fn new(db: &Database) -> Self {
        Self {
            orders: db.collection("orders"),
            attempts: db.collection("payment_attempts"),
        }
    }

    /// Indexes backing correlation lookup and the reconciliation scan.
    pub async fn init_indexes(&self) -> Result<(), AppError> {
        let checkout_idx = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("checkout_request_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let order_idx = IndexModel::builder()
            .keys(doc! { "order_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("order_attempts_idx".to_string())
                    .build(),
            )
            .build();

        let pending_idx = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("pending_scan_idx".to_string())
                    .build(),
            )
            .build();

        self.attempts
            .create_indexes([checkout_idx, order_idx, pending_idx], None)
            .await?;

        tracing::info!("payment attempt indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MongoOrderStore {
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        let order = self.orders.find_one(doc! { "_id": order_id }, None).await?;
        Ok(order)
    }

    async fn record_attempt(&self, attempt: PaymentAttempt) -> Result<(), AppError> {
        self.attempts.insert_one(attempt, None).await?;
        Ok(())
    }

    async fn attempt_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let attempt = self
            .attempts
            .find_one(doc! { "checkout_request_id": checkout_request_id }, None)
            .await?;
        Ok(attempt)
    }

    async fn pending_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let filter = doc! {
            "order_id": order_id,
            "status": to_bson(&PaymentStatus::Pending).map_err(|e| AppError::Database(e.into()))?,
        };
        let attempt = self.attempts.find_one(filter, None).await?;
        Ok(attempt)
    }

    async fn latest_attempt_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();
        let attempt = self
            .attempts
            .find_one(doc! { "order_id": order_id }, options)
            .await?;
        Ok(attempt)
    }

    async fn resolve_attempt(
        &self,
        checkout_request_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let filter = doc! {
            "checkout_request_id": checkout_request_id,
            "status": to_bson(&PaymentStatus::Pending).map_err(|e| AppError::Database(e.into()))?,
        };
        let update = doc! {
            "$set": {
                "status": to_bson(&outcome.status).map_err(|e| AppError::Database(e.into()))?,
                "result_code": outcome.result_code,
                "result_desc": outcome.result_desc.clone(),
                "receipt_number": outcome.receipt_number.clone(),
                "transaction_date": outcome.transaction_date,
                "updated_at": DateTime::now(),
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .attempts
            .find_one_and_update(filter, update, options)
            .await?;
        Ok(updated)
    }

    async fn apply_order_payment(
        &self,
        order_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<(), AppError> {
        let paid = to_bson(&PaymentStatus::Paid).map_err(|e| AppError::Database(e.into()))?;
        let pending = to_bson(&PaymentStatus::Pending).map_err(|e| AppError::Database(e.into()))?;
        let status = to_bson(&outcome.status).map_err(|e| AppError::Database(e.into()))?;

        // A failed outcome only applies while the order is still pending;
        // paid/under-review never overwrite an order already marked paid.
        let filter = match outcome.status {
            PaymentStatus::Failed => doc! { "_id": order_id, "payment_status": pending },
            _ => doc! { "_id": order_id, "payment_status": { "$ne": paid } },
        };

        let mut set = doc! {
            "payment_status": status,
            "payment_note": outcome.result_desc.clone(),
        };
        if outcome.status == PaymentStatus::Paid {
            set.insert("mpesa_receipt_number", outcome.receipt_number.clone());
            set.insert("paid_at", DateTime::now());
        }

        let result = self
            .orders
            .update_one(filter, doc! { "$set": set }, None)
            .await?;

        if result.modified_count == 0 {
            tracing::warn!(
                order_id = %order_id,
                status = ?outcome.status,
                "order payment update matched no writable order"
            );
        }

        Ok(())
    }

    async fn mark_order_pending(&self, order_id: &str) -> Result<(), AppError> {
        let paid = to_bson(&PaymentStatus::Paid).map_err(|e| AppError::Database(e.into()))?;
        let pending = to_bson(&PaymentStatus::Pending).map_err(|e| AppError::Database(e.into()))?;

        self.orders
            .update_one(
                doc! { "_id": order_id, "payment_status": { "$ne": paid } },
                doc! { "$set": { "payment_status": pending } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn pending_attempts_older_than(
        &self,
        cutoff: DateTime,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let filter = doc! {
            "status": to_bson(&PaymentStatus::Pending).map_err(|e| AppError::Database(e.into()))?,
            "created_at": { "$lt": cutoff },
        };

        let cursor = self.attempts.find(filter, None).await?;
        let attempts: Vec<PaymentAttempt> = cursor
            .try_collect()
            .await
            .map_err(|e| AppError::Database(anyhow!("pending scan failed: {e}")))?;
        Ok(attempts)
    }
}
