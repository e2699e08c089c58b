//! HMAC-SHA256 webhook signatures (`X-Hub-Signature-256`).
//!
//! Meta signs the exact request body with the app secret. Verification must run
//! on the raw bytes before any JSON parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const PREFIX: &str = "sha256=";

/// `sha256=<hex digest>` of `body` under `secret`.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature_header` against the body. An absent secret fails closed.
pub fn verify_signature(secret: Option<&str>, signature_header: Option<&str>, body: &[u8]) -> bool {
    let secret = secret.map(str::trim).unwrap_or("");
    if secret.is_empty() {
        return false;
    }
    let signature = signature_header.unwrap_or("").trim();
    let Some(signature) = signature.strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "app-secret";
    const BODY: &[u8] = br#"{"object":"page","entry":[]}"#;

    #[test]
    fn matches_reference_digest() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            compute_signature("key", b"The quick brown fox jumps over the lazy dog"),
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn accepts_valid_signature() {
        let header = compute_signature(SECRET, BODY);
        assert!(verify_signature(Some(SECRET), Some(&header), BODY));
    }

    #[test]
    fn rejects_single_byte_mutation() {
        let header = compute_signature(SECRET, BODY);
        let mut tampered = BODY.to_vec();
        tampered[3] ^= 0x01;
        assert!(!verify_signature(Some(SECRET), Some(&header), &tampered));
    }

    #[test]
    fn fails_closed_without_secret() {
        let header = compute_signature(SECRET, BODY);
        assert!(!verify_signature(None, Some(&header), BODY));
        assert!(!verify_signature(Some("  "), Some(&header), BODY));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        let header = compute_signature(SECRET, BODY);
        let bare = header.trim_start_matches("sha256=");
        assert!(!verify_signature(Some(SECRET), None, BODY));
        assert!(!verify_signature(Some(SECRET), Some(bare), BODY));
        assert!(!verify_signature(Some(SECRET), Some("sha256=zz"), BODY));
    }
}
