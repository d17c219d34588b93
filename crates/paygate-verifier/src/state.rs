use crate::config::VerifierConfig;

/// Shared application state for the verifier server.
pub struct AppState {
    /// HMAC shared secret for authenticating /verify requests.
    pub shared_secret: Option<Vec<u8>>,
    pub domain_name: String,
    /// Separate bearer token for /metrics endpoint (not the HMAC secret).
    pub metrics_token: Option<String>,
}

impl From<VerifierConfig> for AppState {
    fn from(config: VerifierConfig) -> Self {
        Self {
            shared_secret: config.shared_secret,
            domain_name: config.domain_name,
            metrics_token: config.metrics_token,
        }
    }
}
