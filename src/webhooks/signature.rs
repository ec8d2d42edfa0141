//! `X-Hub-Signature-256` verification.
//!
//! Each configured repository has its own webhook secret. A delivery is
//! only parsed after its HMAC-SHA256 over the raw body checks out.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    /// Not of the form `sha256=<hex>`.
    #[error("malformed signature header")]
    Malformed,

    #[error("signature does not match")]
    Mismatch,
}

fn decode_header(header: &str) -> Result<Vec<u8>, SignatureError> {
    let hex_sig = header
        .trim()
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    hex::decode(hex_sig).map_err(|_| SignatureError::Malformed)
}

/// Checks `header` against the HMAC of `payload` under `secret`.
///
/// The comparison is constant-time.
pub fn verify(payload: &[u8], header: Option<&str>, secret: &[u8]) -> Result<(), SignatureError> {
    let expected = decode_header(header.ok_or(SignatureError::Missing)?)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

/// The header value GitHub would send for `payload`.
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(payload);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        // HMAC accepts keys of any length
        Err(_) => String::new(),
    }
}

/// Compares a presented bearer token with the configured one in constant
/// time, by checking the HMAC each produces over the same message.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    const MESSAGE: &[u8] = b"merge-queue api token";
    let (Ok(mut expected_mac), Ok(mut presented_mac)) = (
        HmacSha256::new_from_slice(expected.as_bytes()),
        HmacSha256::new_from_slice(presented.as_bytes()),
    ) else {
        return false;
    };
    expected_mac.update(MESSAGE);
    presented_mac.update(MESSAGE);
    presented_mac
        .verify_slice(&expected_mac.finalize().into_bytes())
        .is_ok()
}
