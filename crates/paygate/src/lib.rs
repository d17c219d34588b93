//! x402 micropayment protocol for metered HTTP APIs.
//!
//! A gateway answers unpaid requests with HTTP 402 and a [`PaymentContext`]
//! challenge. The client signs that challenge as EIP-712 typed data and
//! retries with `X-402-Signature` / `X-402-Nonce` headers; a verifier recovers
//! the signer and the gateway serves the request.
//!
//! # Parties
//!
//! - **Client** signs [`Payment`] typed data ([`eip712::sign_context`])
//! - **Gateway** issues challenges, enforces limits, issues receipts
//! - **Verifier** recovers the signer ([`eip712::recover_signer`])

pub mod constants;
pub mod error;
pub mod hmac;
pub mod payment;
pub mod response;
pub mod security;

pub mod eip712;
pub mod nonce_store;

use alloy::sol;

// EIP-712 struct clients sign for each request.
sol! {
    #[derive(Debug)]
    struct Payment {
        address recipient;
        string token;
        string amount;
        string nonce;
    }
}

pub use constants::*;
pub use error::PaygateError;
pub use payment::*;
pub use response::*;
