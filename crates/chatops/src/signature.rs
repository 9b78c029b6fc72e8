//! Slack request signing verification.
//!
//! Slack signs requests with `v0=hex(hmac_sha256(secret,
//! "v0:<timestamp>:<body>"))`. Both the signature and the timestamp
//! freshness are checked before any part of the body is trusted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Reject requests older than this (replay window).
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Verify a Slack request signature.
#[must_use]
pub fn verify_signature(body: &[u8], timestamp: &str, signature: &str, secret: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_part) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks.
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Whether a request timestamp is within the replay window.
#[must_use]
pub fn timestamp_is_fresh(timestamp: &str, now_epoch: i64) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    (now_epoch - ts).abs() <= MAX_TIMESTAMP_SKEW_SECS
}

/// Compute a valid signature (tests and local tooling).
#[must_use]
pub fn sign(body: &[u8], timestamp: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_round_trip() {
        let body = b"payload=%7B%22type%22%3A%22block_actions%22%7D";
        let signature = sign(body, "1700000000", "secret");
        assert!(verify_signature(body, "1700000000", &signature, "secret"));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"data";
        let signature = sign(body, "1700000000", "secret");
        assert!(!verify_signature(body, "1700000000", &signature, "other"));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign(b"original", "1700000000", "secret");
        assert!(!verify_signature(b"tampered", "1700000000", &signature, "secret"));
    }

    #[test]
    fn malformed_signatures_fail_closed() {
        assert!(!verify_signature(b"x", "1700000000", "not-prefixed", "secret"));
        assert!(!verify_signature(b"x", "1700000000", "v0=zzzz", "secret"));
    }

    #[test]
    fn timestamp_freshness() {
        assert!(timestamp_is_fresh("1700000000", 1_700_000_100));
        assert!(!timestamp_is_fresh("1700000000", 1_700_000_000 + 301));
        assert!(!timestamp_is_fresh("garbage", 1_700_000_000));
    }
}
