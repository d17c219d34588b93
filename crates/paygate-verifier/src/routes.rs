use actix_web::{get, post, web, HttpRequest, HttpResponse};
use paygate::eip712::recover_signer_named;
use paygate::security::bearer_matches;
use paygate::{VerifyRequest, VerifyResponse, CORRELATION_ID_HEADER, VERIFIER_AUTH_HEADER};

use crate::metrics;
use crate::state::AppState;

/// Validate the HMAC header when a shared secret is configured.
/// Returns an error response if the signature is missing or invalid.
fn validate_hmac(
    req: &HttpRequest,
    body_bytes: &[u8],
    state: &AppState,
) -> Result<(), HttpResponse> {
    let Some(ref secret) = state.shared_secret else {
        return Ok(());
    };

    let header_value = req
        .headers()
        .get(VERIFIER_AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    match header_value {
        Some(sig) if paygate::hmac::verify_hmac(secret, body_bytes, sig) => Ok(()),
        Some(_) => {
            tracing::warn!("HMAC verification failed, signature mismatch");
            metrics::HMAC_FAILURES.with_label_values(&["invalid"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication failed"
            })))
        }
        None => {
            tracing::warn!("HMAC header missing on authenticated endpoint");
            metrics::HMAC_FAILURES.with_label_values(&["missing"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication required"
            })))
        }
    }
}

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "paygate-verifier",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(ref token) = state.metrics_token {
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if !bearer_matches(authorization, token) {
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "unauthorized",
                "message": "Valid Bearer token required for /metrics"
            }));
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

/// Recover the signer of the submitted context.
///
/// A signature that cannot be decoded or recovered is a negative verdict
/// (200, `is_valid: false`), not a request error; only an unparseable body
/// is a 400.
#[post("/verify")]
pub async fn verify(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if let Err(mut resp) = validate_hmac(&req, &body, &state) {
        echo_correlation_id(&mut resp, &correlation_id);
        return resp;
    }

    let parsed: VerifyRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            metrics::VERIFY_REQUESTS
                .with_label_values(&["malformed"])
                .inc();
            let mut resp = HttpResponse::BadRequest()
                .json(VerifyResponse::invalid(format!("invalid request body: {e}")));
            echo_correlation_id(&mut resp, &correlation_id);
            return resp;
        }
    };

    tracing::info!(
        correlation_id = %correlation_id,
        nonce = %parsed.context.nonce,
        "received verification request"
    );

    let timer = metrics::RECOVERY_SECONDS.start_timer();
    let recovered = recover_signer_named(&parsed.context, &parsed.signature, &state.domain_name);
    timer.observe_duration();

    let verdict = match recovered {
        Ok(address) => {
            metrics::VERIFY_REQUESTS.with_label_values(&["valid"]).inc();
            tracing::info!(correlation_id = %correlation_id, recovered = %address, "signature recovered");
            VerifyResponse::valid(address.to_string())
        }
        Err(e) => {
            metrics::VERIFY_REQUESTS.with_label_values(&["invalid"]).inc();
            tracing::info!(correlation_id = %correlation_id, error = %e, "verification failed");
            VerifyResponse::invalid(format!("Verification failed: {e}"))
        }
    };

    let mut resp = HttpResponse::Ok().json(verdict);
    echo_correlation_id(&mut resp, &correlation_id);
    resp
}

fn echo_correlation_id(resp: &mut HttpResponse, correlation_id: &str) {
    if let Ok(value) = correlation_id.parse() {
        resp.headers_mut().insert(
            actix_web::http::header::HeaderName::from_static("x-correlation-id"),
            value,
        );
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(verify)
        .service(metrics_endpoint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use alloy::signers::local::PrivateKeySigner;
    use paygate::eip712::sign_context;
    use paygate::hmac::compute_hmac;
    use paygate::PaymentContext;

    fn app_state(secret: Option<&str>) -> web::Data<AppState> {
        web::Data::new(AppState {
            shared_secret: secret.map(|s| s.as_bytes().to_vec()),
            domain_name: paygate::EIP712_DOMAIN_NAME.to_string(),
            metrics_token: None,
        })
    }

    fn signed_request(wallet: &PrivateKeySigner, nonce: &str) -> VerifyRequest {
        let context = PaymentContext::with_nonce(nonce);
        let signature = sign_context(wallet, &context).unwrap();
        VerifyRequest { context, signature }
    }

    #[actix_rt::test]
    async fn test_valid_signature_recovers_signer() {
        let app = test::init_service(App::new().app_data(app_state(None)).configure(configure)).await;
        let wallet = PrivateKeySigner::random();

        let req = test::TestRequest::post()
            .uri("/verify")
            .insert_header(("X-Correlation-ID", "abc-1"))
            .set_json(signed_request(&wallet, "n-1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-correlation-id").unwrap(), "abc-1");

        let body: VerifyResponse = test::read_body_json(resp).await;
        assert!(body.is_valid);
        assert_eq!(body.recovered_address, Some(wallet.address().to_string()));
        assert!(body.error.is_none());
    }

    #[actix_rt::test]
    async fn test_malformed_signature_is_negative_verdict() {
        let app = test::init_service(App::new().app_data(app_state(None)).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/verify")
            .set_json(VerifyRequest {
                context: PaymentContext::with_nonce("n"),
                signature: "0x1234".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-correlation-id").unwrap(), "unknown");
        let body: VerifyResponse = test::read_body_json(resp).await;
        assert!(!body.is_valid);
        assert!(body.recovered_address.is_none());
        assert!(body.error.unwrap().starts_with("Verification failed"));
    }

    #[actix_rt::test]
    async fn test_bad_body_is_400() {
        let app = test::init_service(App::new().app_data(app_state(None)).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/verify")
            .set_payload("{\"context\":")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: VerifyResponse = test::read_body_json(resp).await;
        assert!(!body.is_valid);
    }

    #[actix_rt::test]
    async fn test_hmac_required_when_configured() {
        let secret = "shared-secret-for-tests-0123456789";
        let app =
            test::init_service(App::new().app_data(app_state(Some(secret))).configure(configure))
                .await;
        let wallet = PrivateKeySigner::random();
        let body = serde_json::to_vec(&signed_request(&wallet, "n")).unwrap();

        let req = test::TestRequest::post()
            .uri("/verify")
            .set_payload(body.clone())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/verify")
            .insert_header((VERIFIER_AUTH_HEADER, "00".repeat(32)))
            .set_payload(body.clone())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/verify")
            .insert_header((VERIFIER_AUTH_HEADER, compute_hmac(secret.as_bytes(), &body)))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let verdict: VerifyResponse = test::read_body_json(resp).await;
        assert!(verdict.is_valid);
    }

    #[actix_rt::test]
    async fn test_health() {
        let app = test::init_service(App::new().app_data(app_state(None)).configure(configure)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
    }
}
