//! Timing-safe secret comparison.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare two secrets without leaking content or length through timing.
///
/// Both sides are hashed to fixed-size digests first, then compared with
/// `subtle::ConstantTimeEq`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Check an `Authorization` header value against an expected bearer token.
/// Returns false when the header is missing or not a bearer credential.
pub fn bearer_matches(header: Option<&str>, expected: &str) -> bool {
    match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => constant_time_eq(token.trim().as_bytes(), expected.as_bytes()),
        None => false,
    }
}
