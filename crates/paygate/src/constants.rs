/// Base mainnet, the chain payments are quoted on unless configured otherwise.
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// Token symbol quoted in payment challenges.
pub const DEFAULT_TOKEN: &str = "USDC";

/// Price of one metered request, as a decimal string.
pub const DEFAULT_AMOUNT: &str = "0.001";

/// Payee address quoted in payment challenges.
pub const DEFAULT_RECIPIENT: &str = "0x2cAF48b4BA1C58721a85dFADa5aC01C2DFa62219";

/// EIP-712 domain name shared by clients and the verifier.
pub const EIP712_DOMAIN_NAME: &str = "MicroAI Paygate";

/// EIP-712 domain version.
pub const EIP712_DOMAIN_VERSION: &str = "1";

// Request headers
pub const SIGNATURE_HEADER: &str = "X-402-Signature";
pub const NONCE_HEADER: &str = "X-402-Nonce";

// Response headers
pub const RECEIPT_HEADER: &str = "X-402-Receipt";

/// Propagated across gateway, verifier and upstream calls.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// HMAC-SHA256 over the request body, sent to the verifier when a shared
/// secret is configured.
pub const VERIFIER_AUTH_HEADER: &str = "X-Verifier-Auth";

/// Receipt ids are this prefix followed by 32 lowercase hex characters.
pub const RECEIPT_ID_PREFIX: &str = "rcpt_";

/// Version stamped into every receipt body.
pub const RECEIPT_VERSION: &str = "1.0";
