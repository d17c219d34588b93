use alloy::primitives::Address;
use std::time::Duration;
use url::Url;

use paygate::{DEFAULT_AMOUNT, DEFAULT_CHAIN_ID, DEFAULT_RECIPIENT, DEFAULT_TOKEN};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_VERIFIER_URL: &str = "http://127.0.0.1:3002";
const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_OPENROUTER_MODEL: &str = "z-ai/glm-4.5-air:free";
const DEFAULT_CACHE_DB_PATH: &str = "./paygate-cache.db";
const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3001";

/// Per-tier token bucket policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Sustained requests per minute.
    pub rpm: u32,
    /// Bucket capacity.
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub anonymous: TierPolicy,
    pub standard: TierPolicy,
    pub verified: TierPolicy,
    /// Idle buckets older than this are swept; also the sweep period.
    pub cleanup_interval: Duration,
    /// Mixed into nonce-derived keys so they can't be precomputed.
    pub key_salt: String,
    /// Honour `X-Forwarded-For` / `Forwarded` when deriving the client IP.
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Global per-request deadline.
    pub request: Duration,
    /// Deadline for the AI routes (may only shorten the global one).
    pub ai: Duration,
    pub verifier: Duration,
    pub health_check: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    pub db_path: String,
    pub ttl: Duration,
    /// How often expired entries are purged from the backend
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptConfig {
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Bearer key for the upstream completion API
    pub openrouter_api_key: String,
    /// Full chat-completions URL
    pub openrouter_url: String,
    pub openrouter_model: String,
    /// Base URL of the signature verifier service
    pub verifier_url: String,
    /// HMAC shared secret for verifier auth (None = unauthenticated)
    pub verifier_secret: Option<Vec<u8>>,
    pub recipient: String,
    pub payment_token: String,
    pub payment_amount: String,
    pub chain_id: u64,
    pub timeouts: TimeoutConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub receipts: ReceiptConfig,
    /// Hex secp256k1 key used to sign receipts (None = receipts unavailable)
    pub server_private_key: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Bearer token required for /metrics (None = public)
    pub metrics_token: Option<String>,
    /// Reject a nonce that already bought a response
    pub nonce_single_use: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("openrouter_api_key", &"[REDACTED]")
            .field("openrouter_url", &self.openrouter_url)
            .field("openrouter_model", &self.openrouter_model)
            .field("verifier_url", &self.verifier_url)
            .field(
                "verifier_secret",
                &self.verifier_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("recipient", &self.recipient)
            .field("payment_token", &self.payment_token)
            .field("payment_amount", &self.payment_amount)
            .field("chain_id", &self.chain_id)
            .field("timeouts", &self.timeouts)
            .field("rate_limit", &self.rate_limit)
            .field("cache", &self.cache)
            .field("receipts", &self.receipts)
            .field(
                "server_private_key",
                &self.server_private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("nonce_single_use", &self.nonce_single_use)
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source. Empty values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let openrouter_api_key =
            var("OPENROUTER_API_KEY").ok_or(ConfigError::MissingRequired("OPENROUTER_API_KEY"))?;

        let openrouter_url =
            var("OPENROUTER_URL").unwrap_or_else(|| DEFAULT_OPENROUTER_URL.to_string());
        Url::parse(&openrouter_url).map_err(|_| ConfigError::InvalidUrl(openrouter_url.clone()))?;

        let openrouter_model =
            var("OPENROUTER_MODEL").unwrap_or_else(|| DEFAULT_OPENROUTER_MODEL.to_string());

        let verifier_url = var("VERIFIER_URL").unwrap_or_else(|| DEFAULT_VERIFIER_URL.to_string());
        Url::parse(&verifier_url).map_err(|_| ConfigError::InvalidUrl(verifier_url.clone()))?;

        let verifier_secret = var("VERIFIER_SHARED_SECRET").map(String::into_bytes);
        if let Some(ref secret) = verifier_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "VERIFIER_SHARED_SECRET is short ({} bytes, recommended 32+)",
                    secret.len()
                );
            }
        }

        let recipient = match var("RECIPIENT_ADDRESS") {
            Some(addr) => {
                addr.parse::<Address>()
                    .map_err(|_| ConfigError::InvalidAddress(addr.clone()))?;
                addr
            }
            None => {
                tracing::warn!("RECIPIENT_ADDRESS not set, using default");
                DEFAULT_RECIPIENT.to_string()
            }
        };

        let payment_amount = var("PAYMENT_AMOUNT").unwrap_or_else(|| DEFAULT_AMOUNT.to_string());
        let payment_token = var("PAYMENT_TOKEN").unwrap_or_else(|| DEFAULT_TOKEN.to_string());
        let chain_id = parse_or(&var, "CHAIN_ID", DEFAULT_CHAIN_ID);
        let port = parse_or(&var, "PORT", DEFAULT_PORT);

        let timeouts = TimeoutConfig {
            request: positive_secs(&var, "REQUEST_TIMEOUT_SECONDS", 60),
            ai: positive_secs(&var, "AI_REQUEST_TIMEOUT_SECONDS", 30),
            verifier: positive_secs(&var, "VERIFIER_TIMEOUT_SECONDS", 2),
            health_check: positive_secs(&var, "HEALTH_CHECK_TIMEOUT_SECONDS", 2),
        };

        let trust_proxy_headers = flag(&var, "TRUST_PROXY_HEADERS");
        let rate_limit = RateLimitConfig {
            enabled: flag(&var, "RATE_LIMIT_ENABLED"),
            anonymous: TierPolicy {
                rpm: parse_or(&var, "RATE_LIMIT_ANONYMOUS_RPM", 10),
                burst: parse_or(&var, "RATE_LIMIT_ANONYMOUS_BURST", 5),
            },
            standard: TierPolicy {
                rpm: parse_or(&var, "RATE_LIMIT_STANDARD_RPM", 60),
                burst: parse_or(&var, "RATE_LIMIT_STANDARD_BURST", 20),
            },
            verified: TierPolicy {
                rpm: parse_or(&var, "RATE_LIMIT_VERIFIED_RPM", 120),
                burst: parse_or(&var, "RATE_LIMIT_VERIFIED_BURST", 50),
            },
            cleanup_interval: positive_secs(&var, "RATE_LIMIT_CLEANUP_INTERVAL", 300),
            key_salt: var("RATE_LIMIT_KEY_SALT")
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            trust_proxy_headers,
        };
        for (name, tier) in [
            ("anonymous", rate_limit.anonymous),
            ("standard", rate_limit.standard),
            ("verified", rate_limit.verified),
        ] {
            if tier.rpm == 0 || tier.burst == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "RATE_LIMIT_*",
                    value: format!("{name} tier needs rpm > 0 and burst > 0"),
                });
            }
        }

        let backend = match var("CACHE_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => CacheBackend::Memory,
            Some(b) if b == "memory" => CacheBackend::Memory,
            Some(b) if b == "sqlite" => CacheBackend::Sqlite,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "CACHE_BACKEND",
                    value: other,
                })
            }
        };
        let cache = CacheConfig {
            enabled: flag(&var, "CACHE_ENABLED"),
            backend,
            db_path: var("CACHE_DB_PATH").unwrap_or_else(|| DEFAULT_CACHE_DB_PATH.to_string()),
            ttl: positive_secs(&var, "CACHE_TTL_SECONDS", 3600),
            cleanup_interval: positive_secs(&var, "CACHE_CLEANUP_INTERVAL", 300),
        };

        let receipts = ReceiptConfig {
            ttl: positive_secs(&var, "RECEIPT_TTL", 86_400),
            cleanup_interval: positive_secs(&var, "RECEIPT_CLEANUP_INTERVAL", 300),
        };

        let server_private_key = var("SERVER_WALLET_PRIVATE_KEY");
        if server_private_key.is_none() {
            tracing::warn!("SERVER_WALLET_PRIVATE_KEY not set, paid requests will fail at receipt signing");
        }

        let allowed_origins: Vec<String> = var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec![DEFAULT_ALLOWED_ORIGIN.to_string()]);
        if allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::InvalidValue {
                key: "ALLOWED_ORIGINS",
                value: "wildcard origin is not allowed for payment endpoints".to_string(),
            });
        }

        let metrics_token = var("METRICS_TOKEN");
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            port,
            openrouter_api_key,
            openrouter_url,
            openrouter_model,
            verifier_url,
            verifier_secret,
            recipient,
            payment_token,
            payment_amount,
            chain_id,
            timeouts,
            rate_limit,
            cache,
            receipts,
            server_private_key,
            allowed_origins,
            metrics_token,
            nonce_single_use: flag(&var, "NONCE_SINGLE_USE"),
        })
    }
}

fn flag<F: Fn(&str) -> Option<String>>(var: &F, key: &str) -> bool {
    var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
}

/// Parse a value, falling back to `default` with a warning when it is malformed.
fn parse_or<F, T>(var: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match var(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {key}: {raw:?}, using default {default}");
            default
        }),
    }
}

/// Whole seconds; zero, negative or malformed values fall back to the default.
fn positive_secs<F: Fn(&str) -> Option<String>>(var: &F, key: &str, default: u64) -> Duration {
    let secs: i64 = parse_or(var, key, default as i64);
    if secs <= 0 {
        tracing::warn!("{key} must be positive, using default {default}s");
        return Duration::from_secs(default);
    }
    Duration::from_secs(secs as u64)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
