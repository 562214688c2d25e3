//! Keyed HMAC-SHA256 request signatures.
//!
//! Each dispatched request carries a signature over method, URL, and body
//! so the receiving endpoint can verify it came from the queue and was
//! not altered in transit.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Header the signature is delivered in. Value format: `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-hermes-signature";

/// Canonical message: method, URL, and body joined by newlines. The
/// verifier must reconstruct the exact same string.
fn canonical_message(method: &str, url: &str, body: Option<&str>) -> String {
    format!(
        "{}\n{}\n{}",
        method.to_uppercase(),
        url,
        body.unwrap_or("")
    )
}

/// Compute the signature header value for a request.
pub fn compute_signature(
    signing_key: &str,
    method: &str,
    url: &str,
    body: Option<&str>,
) -> Result<String, AppError> {
    if signing_key.is_empty() {
        return Err(AppError::Signing("signing key is empty".into()));
    }
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| AppError::Signing(e.to_string()))?;
    mac.update(canonical_message(method, url, body).as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("sha256={}", hex_encode(&digest)))
}

/// Constant-time verification of a received signature header value.
pub fn verify_signature(
    signing_key: &str,
    method: &str,
    url: &str,
    body: Option<&str>,
    provided: &str,
) -> Result<bool, AppError> {
    let expected = compute_signature(signing_key, method, url, body)?;
    Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = compute_signature("secret", "POST", "https://example.com/hook", Some("{}")).unwrap();
        let b = compute_signature("secret", "POST", "https://example.com/hook", Some("{}")).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        // sha256 prefix + 64 hex chars
        assert_eq!(a.len(), 7 + 64);
    }

    #[test]
    fn signature_covers_all_inputs() {
        let base = compute_signature("secret", "POST", "https://example.com", Some("{}")).unwrap();
        let other_method =
            compute_signature("secret", "GET", "https://example.com", Some("{}")).unwrap();
        let other_url =
            compute_signature("secret", "POST", "https://example.org", Some("{}")).unwrap();
        let other_body =
            compute_signature("secret", "POST", "https://example.com", Some("[]")).unwrap();
        let other_key = compute_signature("hunter2", "POST", "https://example.com", Some("{}")).unwrap();
        assert_ne!(base, other_method);
        assert_ne!(base, other_url);
        assert_ne!(base, other_body);
        assert_ne!(base, other_key);
    }

    #[test]
    fn method_casing_is_canonicalized() {
        let upper = compute_signature("secret", "POST", "https://example.com", None).unwrap();
        let lower = compute_signature("secret", "post", "https://example.com", None).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn empty_key_is_a_signing_error() {
        let err = compute_signature("", "POST", "https://example.com", None).unwrap_err();
        assert!(matches!(err, AppError::Signing(_)));
    }

    #[test]
    fn verify_accepts_valid_and_rejects_tampered() {
        let sig = compute_signature("secret", "POST", "https://example.com", Some("{}")).unwrap();
        assert!(verify_signature("secret", "POST", "https://example.com", Some("{}"), &sig).unwrap());
        assert!(
            !verify_signature("secret", "POST", "https://example.com", Some("[]"), &sig).unwrap()
        );
        assert!(
            !verify_signature("other", "POST", "https://example.com", Some("{}"), &sig).unwrap()
        );
    }
}
