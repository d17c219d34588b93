use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

/// By result: valid, invalid, malformed
pub static VERIFY_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_verifier_verify_total",
        "Verification requests by outcome",
        &["result"]
    )
    .unwrap()
});

// Recovery is pure CPU; anything near the gateway's verifier timeout is a problem.
pub static RECOVERY_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "paygate_verifier_recovery_seconds",
        "Time spent hashing and recovering one signature",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.25]
    )
    .unwrap()
});

/// By reason: missing, invalid
pub static HMAC_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_verifier_hmac_failures_total",
        "Rejected /verify calls from unauthenticated callers",
        &["reason"]
    )
    .unwrap()
});

/// Text exposition of the default registry.
pub fn metrics_output() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
