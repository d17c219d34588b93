//! EIP-712 typed-data signing and signer recovery for payment challenges.
//!
//! - Domain construction ([`payment_domain`], [`payment_domain_named`])
//! - Signing hashes ([`signing_hash`])
//! - Recovery with EIP-2 malleability protection ([`recover_signer`])
//! - Client-side signing ([`sign_context`])

use std::borrow::Cow;

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::constants::{EIP712_DOMAIN_NAME, EIP712_DOMAIN_VERSION};
use crate::{PaygateError, Payment, PaymentContext};

/// Build the payment domain with a custom domain name.
///
/// The verifying contract is always the zero address: payments are signed
/// off-chain and never submitted to a contract.
pub fn payment_domain_named(name: &str, chain_id: u64) -> Eip712Domain {
    Eip712Domain {
        name: Some(Cow::Owned(name.to_string())),
        version: Some(Cow::Borrowed(EIP712_DOMAIN_VERSION)),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(Address::ZERO),
        salt: None,
    }
}

/// Build the payment domain for a chain.
pub fn payment_domain(chain_id: u64) -> Eip712Domain {
    payment_domain_named(EIP712_DOMAIN_NAME, chain_id)
}

/// Convert a wire context into the typed struct that gets hashed.
pub fn to_typed(ctx: &PaymentContext) -> Result<Payment, PaygateError> {
    let recipient: Address = ctx
        .recipient
        .parse()
        .map_err(|e| PaygateError::InvalidPayment(format!("recipient is not an address: {e}")))?;
    Ok(Payment {
        recipient,
        token: ctx.token.clone(),
        amount: ctx.amount.clone(),
        nonce: ctx.nonce.clone(),
    })
}

/// EIP-712 signing hash under a named domain.
pub fn signing_hash_named(ctx: &PaymentContext, domain_name: &str) -> Result<B256, PaygateError> {
    let payment = to_typed(ctx)?;
    Ok(payment.eip712_signing_hash(&payment_domain_named(domain_name, ctx.chain_id)))
}

/// EIP-712 signing hash under the default domain.
pub fn signing_hash(ctx: &PaymentContext) -> Result<B256, PaygateError> {
    signing_hash_named(ctx, EIP712_DOMAIN_NAME)
}

/// secp256k1 curve order N / 2. Signatures with s above it are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Decode a hex signature (with or without `0x`) into exactly 65 bytes.
pub fn decode_signature(signature_hex: &str) -> Result<Signature, PaygateError> {
    let raw = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = alloy::hex::decode(raw)
        .map_err(|e| PaygateError::SignatureError(format!("signature is not hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(PaygateError::SignatureError(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    Signature::from_raw(&bytes)
        .map_err(|e| PaygateError::SignatureError(format!("invalid signature: {e}")))
}

/// Recover the address that signed `ctx` under a named domain.
/// Rejects high-s signatures.
pub fn recover_signer_named(
    ctx: &PaymentContext,
    signature_hex: &str,
    domain_name: &str,
) -> Result<Address, PaygateError> {
    let sig = decode_signature(signature_hex)?;
    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(PaygateError::SignatureError(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }
    let hash = signing_hash_named(ctx, domain_name)?;
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| PaygateError::SignatureError(format!("recovery failed: {e}")))
}

/// Recover the address that signed `ctx` under the default domain.
pub fn recover_signer(ctx: &PaymentContext, signature_hex: &str) -> Result<Address, PaygateError> {
    recover_signer_named(ctx, signature_hex, EIP712_DOMAIN_NAME)
}

/// Sign a challenge the way a wallet would, returning `0x`-prefixed hex.
pub fn sign_context(signer: &PrivateKeySigner, ctx: &PaymentContext) -> Result<String, PaygateError> {
    let hash = signing_hash(ctx)?;
    let sig = signer
        .sign_hash_sync(&hash)
        .map_err(|e| PaygateError::SignatureError(format!("signing failed: {e}")))?;
    Ok(encode_signature_hex(&sig))
}

/// 65-byte signature as `0x` + 130 hex chars, v in the last byte (27/28).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(nonce: &str) -> PaymentContext {
        PaymentContext {
            chain_id: 1,
            ..PaymentContext::with_nonce(nonce)
        }
    }

    #[test]
    fn test_sign_and_recover_roundtrip() {
        let signer = PrivateKeySigner::random();
        let ctx = context("0b5e1a9e-2f55-4a1b-9c34-7c9d4bb0f0aa");

        let sig = sign_context(&signer, &ctx).unwrap();
        assert!(sig.starts_with("0x"));
        assert_eq!(sig.len(), 132);

        let recovered = recover_signer(&ctx, &sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_unprefixed_signature_accepted() {
        let signer = PrivateKeySigner::random();
        let ctx = context("n");
        let sig = sign_context(&signer, &ctx).unwrap();
        let recovered = recover_signer(&ctx, sig.trim_start_matches("0x")).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_different_nonce_recovers_different_address() {
        let signer = PrivateKeySigner::random();
        let sig = sign_context(&signer, &context("nonce-a")).unwrap();
        let recovered = recover_signer(&context("nonce-b"), &sig).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn test_domain_name_is_bound() {
        let signer = PrivateKeySigner::random();
        let ctx = context("n");
        let sig = sign_context(&signer, &ctx).unwrap();
        let recovered = recover_signer_named(&ctx, &sig, "Some Other App").unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn test_chain_id_is_bound() {
        let a = signing_hash(&context("n")).unwrap();
        let b = signing_hash(&PaymentContext::with_nonce("n")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = recover_signer(&context("n"), "0xdeadbeef").unwrap_err();
        assert!(err.to_string().contains("65 bytes"));
    }

    #[test]
    fn test_non_hex_rejected() {
        assert!(recover_signer(&context("n"), "not-a-signature").is_err());
    }

    #[test]
    fn test_bad_recipient_rejected() {
        let mut ctx = context("n");
        ctx.recipient = "nobody".to_string();
        assert!(matches!(
            signing_hash(&ctx),
            Err(PaygateError::InvalidPayment(_))
        ));
    }

    #[test]
    fn test_high_s_rejected() {
        let signer = PrivateKeySigner::random();
        let ctx = context("n");
        let hash = signing_hash(&ctx).unwrap();
        let sig = signer.sign_hash_sync(&hash).unwrap();

        // Flip to the malleable twin: s' = N - s, parity inverted.
        let n = SECP256K1_N_DIV_2 * U256::from(2u8) + U256::from(1u8);
        let high = Signature::new(sig.r(), n - sig.s(), !sig.v());
        let err = recover_signer(&ctx, &encode_signature_hex(&high)).unwrap_err();
        assert!(err.to_string().contains("high-s"));
    }
}
