use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_AMOUNT, DEFAULT_CHAIN_ID, DEFAULT_RECIPIENT, DEFAULT_TOKEN};

/// The challenge a client must sign before a metered request is served.
///
/// One is generated per unpaid request with a fresh nonce. Nothing about it
/// is persisted: on retry the gateway rebuilds it from configuration and the
/// nonce the client echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentContext {
    pub recipient: String,
    pub token: String,
    /// Decimal string, e.g. `"0.001"`.
    pub amount: String,
    pub nonce: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
}

impl PaymentContext {
    /// Context with the default recipient, token, amount and chain.
    pub fn with_nonce(nonce: impl Into<String>) -> Self {
        Self {
            recipient: DEFAULT_RECIPIENT.to_string(),
            token: DEFAULT_TOKEN.to_string(),
            amount: DEFAULT_AMOUNT.to_string(),
            nonce: nonce.into(),
            chain_id: DEFAULT_CHAIN_ID,
        }
    }
}

/// Body of `POST /verify` on the verifier service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub context: PaymentContext,
    pub signature: String,
}
