//! Signed proof-of-service receipts.
//!
//! Every paid response gets a receipt binding the verified payment to the
//! SHA-256 of the exact request and response bytes. The receipt JSON is
//! signed with the server key (EIP-191 personal message) and kept in an
//! in-process index until its TTL runs out. A single sweep task evicts
//! expired entries; lookups already treat them as missing.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use base64::Engine;
use chrono::{DateTime, Utc};
use paygate::{PaymentContext, RECEIPT_ID_PREFIX, RECEIPT_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::metrics::RECEIPTS_ISSUED;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayment {
    pub payer: String,
    pub recipient: String,
    pub amount: String,
    pub token: String,
    pub nonce: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptService {
    pub endpoint: String,
    pub request_hash: String,
    pub response_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub payment: ReceiptPayment,
    pub service: ReceiptService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedReceipt {
    pub receipt: Receipt,
    /// `0x`-prefixed 65-byte signature over the receipt JSON.
    pub signature: String,
    /// `0x`-prefixed compressed SEC1 public key of the signer.
    pub server_public_key: String,
}

impl SignedReceipt {
    /// Value of the `X-402-Receipt` header: base64 of the JSON encoding.
    pub fn to_header_value(&self) -> Result<String, ReceiptError> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn from_header_value(value: &str) -> Result<Self, ReceiptError> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| ReceiptError::Invalid(format!("receipt header is not base64: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("server signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("failed to sign receipt: {0}")]
    Signing(String),

    #[error("invalid receipt: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<ReceiptError> for GatewayError {
    fn from(e: ReceiptError) -> Self {
        GatewayError::ReceiptInvariant(e.to_string())
    }
}

/// `0x` + hex(sha256(bytes)).
pub fn content_hash(bytes: &[u8]) -> String {
    format!("0x{}", alloy::hex::encode(Sha256::digest(bytes)))
}

/// Parse a hex secp256k1 key. Keys of 31 bytes (a dropped leading zero) are
/// left-padded; anything shorter or longer than 32 bytes is rejected.
pub fn parse_server_key(key_hex: &str) -> Result<PrivateKeySigner, ReceiptError> {
    let raw = key_hex.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = alloy::hex::decode(raw)
        .map_err(|e| ReceiptError::KeyUnavailable(format!("invalid private key format: {e}")))?;
    if bytes.len() < 31 {
        return Err(ReceiptError::KeyUnavailable(format!(
            "private key too short: got {} bytes, expected at least 31",
            bytes.len()
        )));
    }
    if bytes.len() > 32 {
        return Err(ReceiptError::KeyUnavailable(format!(
            "private key must be at most 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    PrivateKeySigner::from_bytes(&B256::from(padded))
        .map_err(|e| ReceiptError::KeyUnavailable(format!("failed to parse private key: {e}")))
}

/// Server key, parsed on first use and cached for the life of the process.
pub struct ReceiptSigner {
    key_hex: Option<String>,
    loaded: OnceLock<Result<PrivateKeySigner, String>>,
}

impl ReceiptSigner {
    pub fn new(key_hex: Option<String>) -> Self {
        Self {
            key_hex,
            loaded: OnceLock::new(),
        }
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        let loaded = OnceLock::new();
        let _ = loaded.set(Ok(signer));
        Self {
            key_hex: None,
            loaded,
        }
    }

    fn signer(&self) -> Result<&PrivateKeySigner, ReceiptError> {
        let loaded = self.loaded.get_or_init(|| {
            let key_hex = self
                .key_hex
                .as_deref()
                .ok_or_else(|| "SERVER_WALLET_PRIVATE_KEY not set".to_string())?;
            let signer = parse_server_key(key_hex).map_err(|e| e.to_string())?;
            tracing::info!(address = %signer.address(), "server receipt key loaded");
            Ok(signer)
        });
        loaded
            .as_ref()
            .map_err(|e| ReceiptError::KeyUnavailable(e.clone()))
    }

    pub fn public_key_hex(&self) -> Result<String, ReceiptError> {
        let signer = self.signer()?;
        let point = signer.credential().verifying_key().to_encoded_point(true);
        Ok(format!("0x{}", alloy::hex::encode(point.as_bytes())))
    }

    /// Sign the JSON encoding of `receipt`.
    pub fn sign(&self, receipt: &Receipt) -> Result<SignedReceipt, ReceiptError> {
        let signer = self.signer()?;
        let message = serde_json::to_vec(receipt)?;
        let signature = signer
            .sign_message_sync(&message)
            .map_err(|e| ReceiptError::Signing(e.to_string()))?;
        Ok(SignedReceipt {
            receipt: receipt.clone(),
            signature: format!("0x{}", alloy::hex::encode(signature.as_bytes())),
            server_public_key: self.public_key_hex()?,
        })
    }
}

/// Reject a receipt missing any required field or with a malformed prefix.
pub fn validate(signed: &SignedReceipt) -> Result<(), ReceiptError> {
    let r = &signed.receipt;
    let required = [
        (r.id.as_str(), "receipt id"),
        (r.version.as_str(), "receipt version"),
        (r.payment.payer.as_str(), "payer address"),
        (r.payment.recipient.as_str(), "recipient address"),
        (r.payment.amount.as_str(), "payment amount"),
        (r.payment.token.as_str(), "token"),
        (r.payment.nonce.as_str(), "nonce"),
        (r.service.endpoint.as_str(), "service endpoint"),
        (r.service.request_hash.as_str(), "request hash"),
        (r.service.response_hash.as_str(), "response hash"),
        (signed.signature.as_str(), "signature"),
        (signed.server_public_key.as_str(), "server public key"),
    ];
    if let Some((_, name)) = required.iter().find(|(value, _)| value.is_empty()) {
        return Err(ReceiptError::Invalid(format!("{name} is empty")));
    }
    if r.timestamp.timestamp() == 0 {
        return Err(ReceiptError::Invalid("receipt timestamp is zero".into()));
    }
    if !r.id.starts_with(RECEIPT_ID_PREFIX) {
        return Err(ReceiptError::Invalid(format!(
            "receipt id must start with '{RECEIPT_ID_PREFIX}'"
        )));
    }
    if !signed.signature.starts_with("0x") {
        return Err(ReceiptError::Invalid("signature must start with '0x'".into()));
    }
    if !signed.server_public_key.starts_with("0x") {
        return Err(ReceiptError::Invalid(
            "server public key must start with '0x'".into(),
        ));
    }
    Ok(())
}

struct Entry {
    receipt: Arc<SignedReceipt>,
    expires_at: Instant,
}

/// Issues receipts and serves lookups until expiry.
pub struct ReceiptStore {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    signer: ReceiptSigner,
}

impl ReceiptStore {
    pub fn new(signer: ReceiptSigner, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            signer,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::error!("receipt index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("receipt index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Build, sign, validate and store the receipt for one served request.
    ///
    /// `response` must be the exact body bytes sent to the client.
    pub fn issue(
        &self,
        ctx: &PaymentContext,
        payer: &str,
        endpoint: &str,
        request: &[u8],
        response: &[u8],
    ) -> Result<SignedReceipt, ReceiptError> {
        let receipt = Receipt {
            id: format!("{RECEIPT_ID_PREFIX}{}", uuid::Uuid::new_v4().simple()),
            version: RECEIPT_VERSION.to_string(),
            timestamp: Utc::now(),
            payment: ReceiptPayment {
                payer: payer.to_string(),
                recipient: ctx.recipient.clone(),
                amount: ctx.amount.clone(),
                token: ctx.token.clone(),
                nonce: ctx.nonce.clone(),
                chain_id: ctx.chain_id,
            },
            service: ReceiptService {
                endpoint: endpoint.to_string(),
                request_hash: content_hash(request),
                response_hash: content_hash(response),
            },
        };
        let signed = self.signer.sign(&receipt)?;
        validate(&signed)?;

        self.write().insert(
            signed.receipt.id.clone(),
            Entry {
                receipt: Arc::new(signed.clone()),
                expires_at: Instant::now() + self.ttl,
            },
        );
        RECEIPTS_ISSUED.inc();
        tracing::debug!(receipt_id = %signed.receipt.id, "receipt issued");
        Ok(signed)
    }

    /// A live receipt. Expired entries read as not found.
    pub fn get(&self, id: &str) -> Option<Arc<SignedReceipt>> {
        let entries = self.read();
        let entry = entries.get(id)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(Arc::clone(&entry.receipt))
    }

    /// Remove every expired entry in one pass. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired receipts");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The single periodic sweep task for this store.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}
