use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static PAYMENTS_INITIATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PAYMENT_CALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static RECONCILIATION_RESOLUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Install the recorder and register business counters.
///
/// Called once from the binary entrypoint; tests build routers without it,
/// the record helpers are no-ops until initialization.
pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if METRICS_HANDLE.set(handle).is_err() {
        panic!("failed to set metrics handle: already initialized");
    }

    let registry = Registry::new();

    let initiated = IntCounterVec::new(
        Opts::new(
            "payments_initiated_total",
            "STK push initiations by result",
        ),
        &["result"],
    )
    .expect("failed to create payments_initiated_total metric");

    let callbacks = IntCounterVec::new(
        Opts::new(
            "payment_callbacks_total",
            "Gateway callbacks by processing outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create payment_callbacks_total metric");

    let reconciliations = IntCounterVec::new(
        Opts::new(
            "reconciliation_resolutions_total",
            "Stale pending attempts resolved by the sweeper, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create reconciliation_resolutions_total metric");

    registry
        .register(Box::new(initiated.clone()))
        .expect("failed to register payments_initiated_total");
    registry
        .register(Box::new(callbacks.clone()))
        .expect("failed to register payment_callbacks_total");
    registry
        .register(Box::new(reconciliations.clone()))
        .expect("failed to register reconciliation_resolutions_total");

    PROMETHEUS_REGISTRY
        .set(registry)
        .expect("failed to set prometheus registry");
    PAYMENTS_INITIATED_TOTAL
        .set(initiated)
        .expect("failed to set payments_initiated_total");
    PAYMENT_CALLBACKS_TOTAL
        .set(callbacks)
        .expect("failed to set payment_callbacks_total");
    RECONCILIATION_RESOLUTIONS_TOTAL
        .set(reconciliations)
        .expect("failed to set reconciliation_resolutions_total");
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_initiation(result: &str) {
    if let Some(counter) = PAYMENTS_INITIATED_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn record_callback(outcome: &str) {
    if let Some(counter) = PAYMENT_CALLBACKS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_reconciliation(outcome: &str) {
    if let Some(counter) = RECONCILIATION_RESOLUTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}
