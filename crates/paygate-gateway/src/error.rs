use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use paygate::PaymentContext;

/// Every way a request through the gateway can end without a result.
///
/// Internal details are logged when the response is built and never
/// included in the body.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No signature/nonce yet: a protocol step, answered with a challenge.
    #[error("payment required")]
    PaymentRequired(Box<PaymentContext>),

    #[error("invalid signature: {0:?}")]
    InvalidSignature(Option<String>),

    #[error("verifier timed out")]
    VerifierTimeout,

    #[error("verifier failed: {0}")]
    VerifierFailed(String),

    #[error("upstream model timed out")]
    UpstreamTimeout,

    #[error("upstream model failed: {0}")]
    UpstreamFailed(String),

    #[error("request body exceeds limit")]
    PayloadTooLarge,

    #[error("request body is not valid JSON")]
    InvalidBody,

    #[error("text field is empty")]
    EmptyText,

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("nonce already used")]
    NonceReused,

    #[error("receipt not found")]
    ReceiptNotFound,

    /// Receipt failed validation or signing. Never expected in a correct
    /// deployment.
    #[error("receipt invariant violated: {0}")]
    ReceiptInvariant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            GatewayError::VerifierTimeout | GatewayError::UpstreamTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidBody | GatewayError::EmptyText => StatusCode::BAD_REQUEST,
            GatewayError::NonceReused => StatusCode::CONFLICT,
            GatewayError::ReceiptNotFound => StatusCode::NOT_FOUND,
            GatewayError::VerifierFailed(_)
            | GatewayError::UpstreamFailed(_)
            | GatewayError::BodyRead(_)
            | GatewayError::ReceiptInvariant(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            GatewayError::PaymentRequired(ctx) => serde_json::json!({
                "error": "Payment Required",
                "message": "Please sign the payment context",
                "paymentContext": ctx,
            }),
            GatewayError::InvalidSignature(details) => serde_json::json!({
                "error": "Invalid Signature",
                "details": details,
            }),
            GatewayError::VerifierTimeout => serde_json::json!({
                "error": "Gateway Timeout",
                "message": "Verifier request timed out",
            }),
            GatewayError::VerifierFailed(msg) => {
                tracing::error!("verification service failed: {msg}");
                serde_json::json!({
                    "error": "Verification Service Failed",
                    "message": "An internal error occurred",
                })
            }
            GatewayError::UpstreamTimeout => serde_json::json!({
                "error": "Gateway Timeout",
                "message": "AI request timed out",
            }),
            GatewayError::UpstreamFailed(msg) => {
                tracing::error!("AI service failed: {msg}");
                serde_json::json!({
                    "error": "AI Service Failed",
                    "message": "An internal error occurred",
                })
            }
            GatewayError::PayloadTooLarge => serde_json::json!({
                "error": "Payload too large",
                "max_size": "10MB",
            }),
            GatewayError::InvalidBody => serde_json::json!({
                "error": "Invalid request body",
                "message": "Request must be valid JSON",
            }),
            GatewayError::EmptyText => serde_json::json!({
                "error": "Invalid request",
                "message": "text field cannot be empty",
            }),
            GatewayError::BodyRead(msg) => {
                tracing::warn!("failed to read request body: {msg}");
                serde_json::json!({ "error": "Failed to read request body" })
            }
            GatewayError::NonceReused => serde_json::json!({
                "error": "Nonce Already Used",
                "message": "Request a new payment context and sign it",
            }),
            GatewayError::ReceiptNotFound => serde_json::json!({
                "error": "Receipt not found",
                "message": "Receipt may have expired or never existed",
            }),
            GatewayError::ReceiptInvariant(msg) => {
                tracing::error!("RECEIPT INVARIANT VIOLATED: {msg}");
                serde_json::json!({
                    "error": "Failed to generate receipt",
                    "message": "An internal error occurred",
                })
            }
            GatewayError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                serde_json::json!({
                    "error": "Internal Server Error",
                    "message": "An internal error occurred",
                })
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
