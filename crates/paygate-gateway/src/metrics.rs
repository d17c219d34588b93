use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request counters
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("paygate_requests_total", "Total number of requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// Rate limiting
pub static RATE_LIMITED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "paygate_rate_limited_total",
            "Requests rejected by the rate limiter",
        ),
        &["tier"],
    )
    .unwrap()
});

pub static GUARD_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "paygate_request_timeouts_total",
        "Requests answered with 504 by the timeout guard",
    )
    .unwrap()
});

// Payment verification, by outcome: valid, invalid, timeout, error
pub static VERIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("paygate_verifications_total", "Signature verifications"),
        &["outcome"],
    )
    .unwrap()
});

pub static NONCE_REPLAYS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "paygate_nonce_replays_total",
        "Requests rejected for reusing a spent nonce",
    )
    .unwrap()
});

// Cache, by result: hit, miss, error
pub static CACHE_LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("paygate_cache_lookups_total", "Response cache lookups"),
        &["result"],
    )
    .unwrap()
});

pub static CACHE_STORE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "paygate_cache_store_failures_total",
        "Background cache writes that failed or timed out",
    )
    .unwrap()
});

// Upstream model
pub static UPSTREAM_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("paygate_upstream_latency_seconds", "Upstream completion latency")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .unwrap()
});

pub static RECEIPTS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("paygate_receipts_issued_total", "Signed receipts issued").unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(RATE_LIMITED.clone())).unwrap();
        REGISTRY.register(Box::new(GUARD_TIMEOUTS.clone())).unwrap();
        REGISTRY.register(Box::new(VERIFICATIONS.clone())).unwrap();
        REGISTRY.register(Box::new(NONCE_REPLAYS.clone())).unwrap();
        REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())).unwrap();
        REGISTRY
            .register(Box::new(CACHE_STORE_FAILURES.clone()))
            .unwrap();
        REGISTRY.register(Box::new(UPSTREAM_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(RECEIPTS_ISSUED.clone())).unwrap();
    });
}
