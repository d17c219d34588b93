//! `HttpVerifier` against a real verifier server on a loopback port.

use std::net::TcpListener;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use alloy::signers::local::PrivateKeySigner;
use paygate::eip712::sign_context;
use paygate::{PaymentContext, VerifyRequest};
use paygate_gateway::probe::ProbeStatus;
use paygate_gateway::verification::{HttpVerifier, SignatureVerifier, VerifierCallError};

const SECRET: &str = "loopback-shared-secret-0123456789";

fn start_verifier(secret: Option<&str>) -> (String, ServerHandle) {
    let state = web::Data::new(paygate_verifier::AppState {
        shared_secret: secret.map(|s| s.as_bytes().to_vec()),
        domain_name: paygate::EIP712_DOMAIN_NAME.to_string(),
        metrics_token: None,
    });
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(paygate_verifier::routes::configure)
    })
    .workers(1)
    .disable_signals()
    .listen(listener)
    .unwrap()
    .run();
    let handle = server.handle();
    actix_rt::spawn(server);
    (format!("http://127.0.0.1:{port}"), handle)
}

fn client(base_url: &str, secret: Option<&str>) -> HttpVerifier {
    HttpVerifier::new(
        reqwest::Client::new(),
        base_url,
        secret.map(|s| s.as_bytes().to_vec()),
        Duration::from_secs(2),
    )
}

fn signed(wallet: &PrivateKeySigner, nonce: &str) -> VerifyRequest {
    let context = PaymentContext::with_nonce(nonce);
    let signature = sign_context(wallet, &context).unwrap();
    VerifyRequest { context, signature }
}

#[actix_rt::test]
async fn test_recovers_signer_over_http_with_hmac() {
    let (url, handle) = start_verifier(Some(SECRET));
    let verifier = client(&url, Some(SECRET));
    let wallet = PrivateKeySigner::random();

    let verdict = verifier
        .verify(&signed(&wallet, "loop-1"), Some("cid-loop"))
        .await
        .unwrap();
    assert!(verdict.is_valid);
    assert_eq!(verdict.recovered_address, Some(wallet.address().to_string()));

    let mut tampered = signed(&wallet, "loop-2");
    tampered.context.amount = "999".to_string();
    let verdict = verifier.verify(&tampered, None).await.unwrap();
    assert_ne!(
        verdict.recovered_address,
        Some(wallet.address().to_string())
    );

    assert_eq!(verifier.probe().await, ProbeStatus::Ok);
    handle.stop(false).await;
}

#[actix_rt::test]
async fn test_wrong_secret_is_rejected() {
    let (url, handle) = start_verifier(Some(SECRET));
    let verifier = client(&url, Some("not-the-shared-secret-0123456789"));
    let wallet = PrivateKeySigner::random();

    let err = verifier
        .verify(&signed(&wallet, "loop-3"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifierCallError::Status(401)));

    let unsigned = client(&url, None);
    let err = unsigned
        .verify(&signed(&wallet, "loop-4"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifierCallError::Status(401)));
    handle.stop(false).await;
}

#[actix_rt::test]
async fn test_unreachable_verifier() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let verifier = client(&format!("http://127.0.0.1:{port}"), None);
    assert_eq!(verifier.probe().await, ProbeStatus::Unreachable);

    let wallet = PrivateKeySigner::random();
    let err = verifier
        .verify(&signed(&wallet, "loop-5"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifierCallError::Transport(_)));
}
