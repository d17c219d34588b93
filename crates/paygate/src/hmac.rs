//! Shared-secret authentication of gateway → verifier calls.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &[u8], body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac
}

/// Hex-encoded HMAC-SHA256 of `body`, sent in `X-Verifier-Auth`.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    alloy::hex::encode(keyed(secret, body).finalize().into_bytes())
}

/// Check an `X-Verifier-Auth` value in constant time.
/// Malformed hex is compared against zeros rather than short-circuiting.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let expected = alloy::hex::decode(signature).unwrap_or_else(|_| vec![0u8; 32]);
    keyed(secret, body).verify_slice(&expected).is_ok()
}
