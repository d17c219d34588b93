//! CORS configuration for the gateway binary.

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};

/// Build the CORS middleware from the configured origin allowlist.
///
/// Wildcard origins are rejected at config load, so every origin here is
/// matched exactly.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == origin_str)
        })
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-402-signature"),
            HeaderName::from_static("x-402-nonce"),
            HeaderName::from_static("x-correlation-id"),
        ])
        .expose_headers(vec![
            header::CONTENT_LENGTH,
            header::RETRY_AFTER,
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderName::from_static("x-402-receipt"),
            HeaderName::from_static("x-correlation-id"),
        ])
        .max_age(3600)
}
