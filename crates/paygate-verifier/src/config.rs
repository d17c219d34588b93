use paygate::EIP712_DOMAIN_NAME;

const DEFAULT_PORT: u16 = 3002;

#[derive(Clone)]
pub struct VerifierConfig {
    pub port: u16,
    /// HMAC secret shared with the gateway (None = unauthenticated)
    pub shared_secret: Option<Vec<u8>>,
    /// EIP-712 domain name clients sign under
    pub domain_name: String,
    /// Bearer token required for /metrics (None = public)
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for VerifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierConfig")
            .field("port", &self.port)
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("domain_name", &self.domain_name)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl VerifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `VERIFIER_PORT` wins over `PORT`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("VERIFIER_PORT").or_else(|| var("PORT")) {
            None => DEFAULT_PORT,
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "VERIFIER_PORT",
                value: raw.clone(),
            })?,
        };

        let shared_secret = var("VERIFIER_SHARED_SECRET").map(String::into_bytes);
        match shared_secret {
            None => tracing::warn!("VERIFIER_SHARED_SECRET not set, /verify is unauthenticated"),
            Some(ref s) if s.len() < 32 => tracing::warn!(
                "VERIFIER_SHARED_SECRET is short ({} bytes, recommended 32+)",
                s.len()
            ),
            Some(_) => {}
        }

        Ok(Self {
            port,
            shared_secret,
            domain_name: var("EIP712_DOMAIN_NAME").unwrap_or_else(|| EIP712_DOMAIN_NAME.to_string()),
            metrics_token: var("METRICS_TOKEN"),
        })
    }
}
