use actix_web::{web, HttpRequest, HttpResponse};
use paygate::security::bearer_matches;

use crate::metrics::REGISTRY;
use crate::state::AppState;

/// GET /healthz - liveness
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "gateway",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /readyz - probes the verifier and the upstream model API concurrently
pub async fn readyz(state: web::Data<AppState>) -> HttpResponse {
    let (verifier, upstream) = tokio::join!(state.verifier.probe(), state.summarizer.probe());
    let ready = verifier.is_ok() && upstream.is_ok();

    let body = serde_json::json!({
        "ready": ready,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "checks": {
            "verifier": verifier,
            "openrouter": upstream,
            "gateway": {
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": state.started_at.elapsed().as_secs(),
                "receipts_stored": state.receipts.len(),
                "rate_limit_buckets": state.limiter.bucket_count(),
            },
        },
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        tracing::warn!(?verifier, ?upstream, "readiness check failed");
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// GET /metrics - Prometheus metrics endpoint (optionally auth-gated)
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(ref expected_token) = state.config.metrics_token {
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if !bearer_matches(authorization, expected_token) {
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "unauthorized",
                "message": "Valid Bearer token required for /metrics"
            }));
        }
    }

    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().body("Failed to encode metrics");
    }

    let output = String::from_utf8(buffer).unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(output)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/readyz", web::get().to(readyz))
        .route("/metrics", web::get().to(metrics));
}
