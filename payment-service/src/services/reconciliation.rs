//! Reconciliation sweeper.
//!
//! A push whose callback never arrives would otherwise leave its order
//! pending forever. The sweeper periodically finds attempts pending past a
//! deadline, asks the gateway for their verdict, and settles completed
//! ones through the same path as the callback receiver.

use crate::config::ReconciliationConfig;
use crate::services::daraja::{DarajaClient, StkQueryOutcome};
use crate::services::settlement::{settle_attempt, Settlement};
use crate::services::store::OrderStore;
use crate::services::metrics::record_reconciliation;
use crate::models::GatewayResolution;
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;

pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    daraja: DarajaClient,
    interval: Duration,
    pending_deadline_secs: i64,
}

/// Counters from one sweep, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub resolved: usize,
    pub still_processing: usize,
    pub errors: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OrderStore>, daraja: DarajaClient, config: &ReconciliationConfig) -> Self {
        Self {
            store,
            daraja,
            interval: Duration::from_secs(config.interval_secs),
            pending_deadline_secs: config.pending_deadline_secs,
        }
    }

    /// Run sweeps forever. Sweep failures are logged, never fatal.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(stats) if stats.scanned > 0 => {
                    tracing::info!(
                        scanned = stats.scanned,
                        resolved = stats.resolved,
                        still_processing = stats.still_processing,
                        errors = stats.errors,
                        "reconciliation sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
            }
        }
    }

    /// One pass over stale pending attempts.
    pub async fn sweep(&self) -> Result<SweepStats, AppError> {
        let cutoff_millis =
            DateTime::now().timestamp_millis() - self.pending_deadline_secs * 1000;
        let cutoff = DateTime::from_millis(cutoff_millis);

        let attempts = self.store.pending_attempts_older_than(cutoff).await?;
        let mut stats = SweepStats {
            scanned: attempts.len(),
            ..Default::default()
        };

        for attempt in attempts {
            match self.daraja.query_stk_status(&attempt.checkout_request_id).await {
                Ok(StkQueryOutcome::Complete {
                    result_code,
                    result_desc,
                }) => {
                    // The query endpoint reports the verdict only; no
                    // receipt or payer metadata to cross-check.
                    let resolution = GatewayResolution {
                        result_code,
                        result_desc,
                        receipt_number: None,
                        transaction_date: None,
                        confirmed_amount: None,
                        confirmed_msisdn: None,
                    };

                    match settle_attempt(self.store.as_ref(), &attempt, &resolution).await {
                        Ok(Settlement::Applied(status)) => {
                            stats.resolved += 1;
                            record_reconciliation(status.as_str());
                        }
                        Ok(Settlement::AlreadyTerminal) => {
                            // A callback won the race during the sweep.
                            record_reconciliation("already_terminal");
                        }
                        Err(e) => {
                            stats.errors += 1;
                            tracing::error!(
                                checkout_request_id = %attempt.checkout_request_id,
                                error = %e,
                                "failed to settle reconciled attempt"
                            );
                        }
                    }
                }
                Ok(StkQueryOutcome::Processing) => {
                    stats.still_processing += 1;
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        checkout_request_id = %attempt.checkout_request_id,
                        error = %e,
                        "gateway status query failed"
                    );
                }
            }
        }

        Ok(stats)
    }
}
