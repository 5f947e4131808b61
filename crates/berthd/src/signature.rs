//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,

    #[error("signature must use sha256=<hex> format")]
    Malformed,

    #[error("signature verification failed")]
    Mismatch,

    #[error("hmac key rejected")]
    Key,
}

/// Check `header` against the HMAC-SHA256 of the raw `body`.
///
/// The digest comparison is constant time.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let digest = header
        .trim()
        .strip_prefix(PREFIX)
        .ok_or(SignatureError::Malformed)?;
    let expected = hex::decode(digest).map_err(|_| SignatureError::Malformed)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Key)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Header value a sender with `secret` would attach to `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Key)?;
    mac.update(body);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_signed_body_verifies() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign(SECRET, body).unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(verify(SECRET, body, Some(&header)), Ok(()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let header = sign(SECRET, b"original").unwrap();
        assert_eq!(
            verify(SECRET, b"tampered", Some(&header)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(b"another-secret", b"original", Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_header_format() {
        assert_eq!(verify(SECRET, b"x", None), Err(SignatureError::Missing));
        assert_eq!(
            verify(SECRET, b"x", Some("sha1=abcd")),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(SECRET, b"x", Some("sha256=not-hex")),
            Err(SignatureError::Malformed)
        );
    }
}
