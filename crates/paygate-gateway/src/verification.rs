//! Payment verification against the external verifier service.
//!
//! [`PaymentVerifier`] rebuilds the challenge from configuration plus the
//! caller's nonce, hands it to a [`SignatureVerifier`] under the request
//! deadline, and classifies failures as timeout or generic. A negative
//! verdict (`is_valid = false`) is a normal result, not an error.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use paygate::hmac::compute_hmac;
use paygate::{
    PaymentContext, VerifyRequest, VerifyResponse, CORRELATION_ID_HEADER, VERIFIER_AUTH_HEADER,
};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::VERIFICATIONS;
use crate::probe::ProbeStatus;
use crate::timeout::{bounded, RequestDeadline};

/// Transport-level failure talking to a verifier.
#[derive(Debug, thiserror::Error)]
pub enum VerifierCallError {
    #[error("verifier request timed out")]
    Timeout,

    #[error("verifier transport error: {0}")]
    Transport(String),

    #[error("verifier returned status {0}")]
    Status(u16),

    #[error("failed to decode verifier response: {0}")]
    Decode(String),
}

/// Anything that can check a signature over a payment context.
pub trait SignatureVerifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
        correlation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<VerifyResponse, VerifierCallError>>;

    /// Readiness check used by `/readyz`.
    fn probe(&self) -> BoxFuture<'_, ProbeStatus>;
}

/// Verifier reached over HTTP (`POST {base}/verify`, `GET {base}/health`).
pub struct HttpVerifier {
    client: reqwest::Client,
    base_url: String,
    secret: Option<Vec<u8>>,
    probe_timeout: Duration,
}

impl HttpVerifier {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        secret: Option<Vec<u8>>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            probe_timeout,
        }
    }

    async fn post_verify(
        &self,
        request: &VerifyRequest,
        correlation_id: Option<&str>,
    ) -> Result<VerifyResponse, VerifierCallError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| VerifierCallError::Decode(format!("failed to encode request: {e}")))?;

        let mut builder = self
            .client
            .post(format!("{}/verify", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(ref secret) = self.secret {
            builder = builder.header(VERIFIER_AUTH_HEADER, compute_hmac(secret, &body));
        }
        if let Some(cid) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = builder.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                VerifierCallError::Timeout
            } else {
                VerifierCallError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifierCallError::Status(status.as_u16()));
        }

        response
            .json::<VerifyResponse>()
            .await
            .map_err(|e| VerifierCallError::Decode(e.to_string()))
    }
}

impl SignatureVerifier for HttpVerifier {
    fn verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
        correlation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<VerifyResponse, VerifierCallError>> {
        Box::pin(self.post_verify(request, correlation_id))
    }

    fn probe(&self) -> BoxFuture<'_, ProbeStatus> {
        Box::pin(async move {
            let result = self
                .client
                .get(format!("{}/health", self.base_url))
                .timeout(self.probe_timeout)
                .send()
                .await;
            match result {
                Ok(resp) => ProbeStatus::from_status(resp.status()),
                Err(e) => {
                    tracing::debug!(error = %e, "verifier health probe failed");
                    ProbeStatus::Unreachable
                }
            }
        })
    }
}

/// Classified verification failure.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("verifier timed out")]
    Timeout,

    #[error("verification failed: {0}")]
    Failed(String),
}

impl From<VerificationError> for GatewayError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::Timeout => GatewayError::VerifierTimeout,
            VerificationError::Failed(msg) => GatewayError::VerifierFailed(msg),
        }
    }
}

/// Builds challenges and proves that callers signed them.
pub struct PaymentVerifier {
    verifier: Arc<dyn SignatureVerifier>,
    recipient: String,
    token: String,
    amount: String,
    chain_id: u64,
    timeout: Duration,
}

impl PaymentVerifier {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, config: &GatewayConfig) -> Self {
        Self {
            verifier,
            recipient: config.recipient.clone(),
            token: config.payment_token.clone(),
            amount: config.payment_amount.clone(),
            chain_id: config.chain_id,
            timeout: config.timeouts.verifier,
        }
    }

    /// The context a caller using `nonce` must have signed.
    pub fn context_for(&self, nonce: &str) -> PaymentContext {
        PaymentContext {
            recipient: self.recipient.clone(),
            token: self.token.clone(),
            amount: self.amount.clone(),
            nonce: nonce.to_string(),
            chain_id: self.chain_id,
        }
    }

    /// A fresh challenge for an unpaid request.
    pub fn challenge(&self) -> PaymentContext {
        self.context_for(&uuid::Uuid::new_v4().to_string())
    }

    pub async fn verify(
        &self,
        deadline: Option<RequestDeadline>,
        signature: &str,
        nonce: &str,
        correlation_id: Option<&str>,
    ) -> Result<(VerifyResponse, PaymentContext), VerificationError> {
        let request = VerifyRequest {
            context: self.context_for(nonce),
            signature: signature.to_string(),
        };

        let outcome = bounded(
            deadline,
            self.timeout,
            self.verifier.verify(&request, correlation_id),
        )
        .await;

        let response = match outcome {
            Err(_) | Ok(Err(VerifierCallError::Timeout)) => {
                VERIFICATIONS.with_label_values(&["timeout"]).inc();
                tracing::warn!(correlation_id, "verifier request timed out");
                return Err(VerificationError::Timeout);
            }
            Ok(Err(e)) => {
                VERIFICATIONS.with_label_values(&["error"]).inc();
                return Err(VerificationError::Failed(e.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        let label = if response.is_valid { "valid" } else { "invalid" };
        VERIFICATIONS.with_label_values(&[label]).inc();
        tracing::debug!(
            correlation_id,
            is_valid = response.is_valid,
            recovered = response.recovered_address.as_deref(),
            "payment verified"
        );
        Ok((response, request.context))
    }

    pub async fn probe(&self) -> ProbeStatus {
        self.verifier.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        delay: Duration,
        answer: fn(&VerifyRequest) -> Result<VerifyResponse, VerifierCallError>,
        seen: Mutex<Vec<(VerifyRequest, Option<String>)>>,
    }

    impl Scripted {
        fn new(answer: fn(&VerifyRequest) -> Result<VerifyResponse, VerifierCallError>) -> Self {
            Self {
                delay: Duration::ZERO,
                answer,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl SignatureVerifier for Scripted {
        fn verify<'a>(
            &'a self,
            request: &'a VerifyRequest,
            correlation_id: Option<&'a str>,
        ) -> BoxFuture<'a, Result<VerifyResponse, VerifierCallError>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push((request.clone(), correlation_id.map(String::from)));
                tokio::time::sleep(self.delay).await;
                (self.answer)(request)
            })
        }

        fn probe(&self) -> BoxFuture<'_, ProbeStatus> {
            Box::pin(async { ProbeStatus::Ok })
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::from_lookup(|key| match key {
            "OPENROUTER_API_KEY" => Some("k".to_string()),
            "CHAIN_ID" => Some("84532".to_string()),
            "PAYMENT_AMOUNT" => Some("0.05".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_builds_context_from_config_and_nonce() {
        let scripted = Arc::new(Scripted::new(|_| Ok(VerifyResponse::valid("0xabc"))));
        let verifier = PaymentVerifier::new(scripted.clone(), &config());

        let (resp, ctx) = verifier
            .verify(None, "0xsig", "nonce-7", Some("cid-1"))
            .await
            .unwrap();
        assert!(resp.is_valid);
        assert_eq!(ctx.nonce, "nonce-7");
        assert_eq!(ctx.chain_id, 84532);
        assert_eq!(ctx.amount, "0.05");
        assert_eq!(ctx.token, "USDC");

        let seen = scripted.seen.lock().unwrap();
        assert_eq!(seen[0].0.signature, "0xsig");
        assert_eq!(seen[0].0.context, ctx);
        assert_eq!(seen[0].1.as_deref(), Some("cid-1"));
    }

    #[tokio::test]
    async fn test_negative_verdict_is_not_an_error() {
        let verifier = PaymentVerifier::new(
            Arc::new(Scripted::new(|_| Ok(VerifyResponse::invalid("recovered wrong signer")))),
            &config(),
        );
        let (resp, _) = verifier.verify(None, "0xsig", "n", None).await.unwrap();
        assert!(!resp.is_valid);
        assert_eq!(resp.error.as_deref(), Some("recovered wrong signer"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_generic() {
        let verifier = PaymentVerifier::new(
            Arc::new(Scripted::new(|_| Err(VerifierCallError::Status(502)))),
            &config(),
        );
        let err = verifier.verify(None, "0xsig", "n", None).await.unwrap_err();
        assert!(matches!(err, VerificationError::Failed(_)));
        assert!(matches!(GatewayError::from(err), GatewayError::VerifierFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_verifier_times_out() {
        let mut slow = Scripted::new(|_| Ok(VerifyResponse::valid("0xabc")));
        slow.delay = Duration::from_secs(10);
        let verifier = PaymentVerifier::new(Arc::new(slow), &config());
        let err = verifier.verify(None, "0xsig", "n", None).await.unwrap_err();
        assert!(matches!(err, VerificationError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_shortens_verifier_timeout() {
        let mut slow = Scripted::new(|_| Ok(VerifyResponse::valid("0xabc")));
        slow.delay = Duration::from_millis(500);
        let verifier = PaymentVerifier::new(Arc::new(slow), &config());

        // Verifier budget is 2s, but the request only has 100ms left.
        let deadline = RequestDeadline::after(Duration::from_millis(100));
        let err = verifier
            .verify(Some(deadline), "0xsig", "n", None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Timeout));
    }

    #[tokio::test]
    async fn test_challenge_has_fresh_nonce() {
        let verifier = PaymentVerifier::new(
            Arc::new(Scripted::new(|_| Ok(VerifyResponse::valid("0x")))),
            &config(),
        );
        let a = verifier.challenge();
        let b = verifier.challenge();
        assert_ne!(a.nonce, b.nonce);
        assert!(uuid::Uuid::parse_str(&a.nonce).is_ok());
        assert_eq!(a.chain_id, 84532);
    }
}
