//! Webhook body signing and verification.
//!
//! Outbound bodies carry `X-Webhook-Signature: sha256=<hex>` where the
//! digest is HMAC-SHA256 over the exact bytes transmitted. Inbound
//! callback verification mirrors the signing and compares in constant
//! time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature header value for a body: `sha256=<hex digest>`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature over the raw received body.
///
/// Uses constant-time comparison to prevent timing attacks. The
/// `sha256=` prefix is optional on the provided value.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);

    let provided = match hex::decode(sig_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false, // Invalid hex = reject
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}
