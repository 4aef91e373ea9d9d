//! Webhook payload signatures
//!
//! HMAC-SHA256 over the exact bytes of the request body, hex-encoded and
//! carried as `X-Webhook-Signature: sha256=<hex>`. Signing happens on the
//! serialized bytes that go on the wire; the body is never re-serialized or
//! pretty-printed between signing and sending.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header value prefix
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a body with an endpoint secret
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a received signature header against a body. Comparison happens in
/// constant time via the MAC verifier.
pub fn verify(body: &[u8], secret: &str, signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Generate a fresh endpoint secret
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}
