//! Per-endpoint secrets and HMAC-SHA256 payload signatures.
//!
//! Receivers verify a delivery by recomputing `sign(body, secret)` over the
//! raw request body and comparing it with the value they were given.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Secret length in bytes before hex encoding.
const SECRET_BYTES: usize = 32;

/// Generate a new endpoint secret: 32 bytes from the OS CSPRNG, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hex-encoded HMAC-SHA256 of `payload` keyed by `secret`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify `signature` (hex) against `payload` in constant time.
///
/// Accepts an optional `sha256=` prefix as receivers commonly forward the
/// header value untouched.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let expected = sign(payload, secret);
    provided
        .to_ascii_lowercase()
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into()
}
