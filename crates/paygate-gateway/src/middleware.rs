//! Request-scoped middleware: correlation IDs, panic recovery and tiered
//! rate limiting. All three are plain async functions mounted with
//! [`actix_web::middleware::from_fn`].
//!
//! None of them may hold a copy of the `HttpRequest` while the inner service
//! runs: routing needs sole ownership to record path parameters. Failures
//! below therefore travel outward as `actix_web::Error`, and the correlation
//! header is attached to those through a response mapper.

use std::panic::AssertUnwindSafe;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::middleware::Next;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use futures::FutureExt;
use paygate::{CORRELATION_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER};

use crate::error::GatewayError;
use crate::metrics::{RATE_LIMITED, REQUESTS_TOTAL};
use crate::rate_limit::RateDecision;
use crate::state::AppState;

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Correlation ID of the current request, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn of(req: &HttpRequest) -> Option<String> {
        req.extensions().get::<CorrelationId>().map(|c| c.0.clone())
    }
}

/// Accept a caller-supplied ID only if it is short printable ASCII.
fn sanitize_correlation_id(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let ok = !raw.is_empty()
        && raw.len() <= MAX_CORRELATION_ID_LEN
        && raw.bytes().all(|b| b.is_ascii_graphic());
    ok.then_some(raw)
}

/// Echo or mint `X-Correlation-ID`, and count the request once it completes.
pub async fn correlation(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    let id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_correlation_id)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(CorrelationId(id.clone()));
    let header = HeaderValue::from_str(&id).ok();
    let method = req.method().clone();

    let mut res = match next.call(req).await {
        Ok(res) => res.map_into_boxed_body(),
        Err(mut e) => {
            let status = e.as_response_error().status_code();
            REQUESTS_TOTAL
                .with_label_values(&[method.as_str(), "unmatched", status.as_str()])
                .inc();
            if let Some(value) = header {
                e.add_response_mapper(move |mut res| {
                    res.headers_mut()
                        .insert(HeaderName::from_static("x-correlation-id"), value.clone());
                    res
                });
            }
            return Err(e);
        }
    };

    if let Some(value) = header {
        res.headers_mut()
            .insert(HeaderName::from_static("x-correlation-id"), value);
    }

    // Use the matched route pattern (not raw path) to prevent cardinality bombs
    let path = res
        .request()
        .match_pattern()
        .unwrap_or_else(|| "unmatched".to_string());
    REQUESTS_TOTAL
        .with_label_values(&[
            res.request().method().as_str(),
            path.as_str(),
            res.status().as_str(),
        ])
        .inc();
    Ok(res)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Turn a panic anywhere below into a JSON 500.
pub async fn recover_panics(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    let path = req.path().to_string();
    match AssertUnwindSafe(next.call(req)).catch_unwind().await {
        Ok(result) => result.map(ServiceResponse::map_into_boxed_body),
        Err(payload) => {
            tracing::error!(
                path = %path,
                panic = panic_message(payload.as_ref()),
                "request handler panicked"
            );
            Err(GatewayError::Internal("request handler panicked".into()).into())
        }
    }
}

/// Client address used for anonymous rate-limit keys.
///
/// Forwarding headers are only honoured when the gateway sits behind a
/// trusted proxy; otherwise anyone could pick their own bucket.
pub fn client_ip(req: &HttpRequest, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(ip) = req.connection_info().realip_remote_addr() {
            return ip.to_string();
        }
    }
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(req: &'a ServiceRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn set_rate_limit_headers(headers: &mut actix_web::http::header::HeaderMap, d: &RateDecision) {
    for (name, value) in [
        ("x-ratelimit-limit", d.limit.to_string()),
        ("x-ratelimit-remaining", d.remaining.to_string()),
        ("x-ratelimit-reset", d.reset.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Charge the request against its tier and reject with 429 when empty.
pub async fn rate_limit(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    let Some(state) = req.app_data::<web::Data<AppState>>().cloned() else {
        return next.call(req).await.map(ServiceResponse::map_into_boxed_body);
    };
    if !state.config.rate_limit.enabled {
        return next.call(req).await.map(ServiceResponse::map_into_boxed_body);
    }

    let ip = client_ip(req.request(), state.config.rate_limit.trust_proxy_headers);
    let (tier, key) = state.limiter.classify(
        header_str(&req, SIGNATURE_HEADER),
        header_str(&req, NONCE_HEADER),
        &ip,
    );
    let decision = state.limiter.check(tier, &key);

    if !decision.allowed {
        RATE_LIMITED.with_label_values(&[tier.as_str()]).inc();
        tracing::warn!(
            tier = tier.as_str(),
            retry_after = decision.retry_after,
            "rate limit exceeded"
        );
        let mut response = HttpResponse::TooManyRequests()
            .insert_header((RETRY_AFTER, decision.retry_after.to_string()))
            .json(serde_json::json!({
                "error": "Too Many Requests",
                "message": "Rate limit exceeded. Please retry later.",
                "retry_after": decision.retry_after,
            }));
        set_rate_limit_headers(response.headers_mut(), &decision);
        return Ok(req.into_response(response));
    }

    let mut res = next.call(req).await?;
    set_rate_limit_headers(res.headers_mut(), &decision);
    Ok(res.map_into_boxed_body())
}
