//! Shared verification helpers: timestamped HMAC-SHA256 (Slack/Discord
//! style) and constant-time shared-secret comparison (Telegram/Neovim).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AdapterError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Reject requests whose timestamp drifts more than this from our clock.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 5 * 60;

/// Verify `v0:<timestamp>:<raw_body>` against `v0=<hex>` in the signature
/// header. The MAC comparison is constant-time via `verify_slice`.
pub fn verify_timestamped_hmac(
    secret: &str,
    timestamp_header: &str,
    signature_header: &str,
    body: &[u8],
    now_ms: i64,
) -> Result<()> {
    let timestamp: i64 = timestamp_header
        .parse()
        .map_err(|_| AdapterError::SignatureInvalid("timestamp is not a number".to_string()))?;
    if (now_ms / 1000 - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(AdapterError::TimestampStale);
    }

    let sig_hex = signature_header
        .strip_prefix("v0=")
        .ok_or_else(|| AdapterError::SignatureInvalid("missing v0= prefix".to_string()))?;
    let expected = hex::decode(sig_hex)
        .map_err(|_| AdapterError::SignatureInvalid("signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::SignatureInvalid("invalid key length".to_string()))?;
    mac.update(b"v0:");
    mac.update(timestamp_header.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AdapterError::SignatureInvalid("signature mismatch".to_string()))
}

/// Produce the `v0=<hex>` signature for a body — used by tests and by
/// outbound tooling that needs to self-sign.
pub fn sign_timestamped(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key len");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time equality for shared-secret headers.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verify an exact-match secret header.
pub fn verify_shared_secret(secret: &str, presented: Option<&str>) -> Result<()> {
    let presented =
        presented.ok_or_else(|| AdapterError::SignatureInvalid("missing secret header".to_string()))?;
    if constant_time_eq(secret, presented) {
        Ok(())
    } else {
        Err(AdapterError::SignatureInvalid("secret mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trip_verifies() {
        let body = b"payload=1";
        let sig = sign_timestamped("s3cret", 1_000, body);
        verify_timestamped_hmac("s3cret", "1000", &sig, body, 1_000_000).unwrap();
    }

    #[test]
    fn tampered_body_fails() {
        let sig = sign_timestamped("s3cret", 1_000, b"payload=1");
        let err = verify_timestamped_hmac("s3cret", "1000", &sig, b"payload=2", 1_000_000)
            .unwrap_err();
        assert_eq!(err.code(), "adapter_signature_invalid");
    }

    #[test]
    fn stale_timestamp_fails_before_mac_check() {
        let sig = sign_timestamped("s3cret", 1_000, b"x");
        // now is 10 minutes past the signed timestamp.
        let err =
            verify_timestamped_hmac("s3cret", "1000", &sig, b"x", (1_000 + 600) * 1000).unwrap_err();
        assert_eq!(err.code(), "adapter_timestamp_stale");
    }

    #[test]
    fn shared_secret_comparison() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(verify_shared_secret("tok", Some("tok")).is_ok());
        assert!(verify_shared_secret("tok", None).is_err());
    }
}
