//! Mercado Pago webhook signatures
//!
//! The `x-signature` header carries `ts=<unix ts>,v1=<hex hmac>`. The HMAC is
//! SHA-256 keyed with the shared webhook secret over the manifest
//!
//! ```text
//! id:<data.id>;request-id:<x-request-id>;ts:<ts>;
//! ```
//!
//! where segments for absent values are left out. No `url:` segment is signed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `x-signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub ts: String,
    pub v1: String,
}

impl SignatureHeader {
    /// Parses `ts=..,v1=..`. Parts may come in any order and unknown keys are skipped.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut ts = None;
        let mut v1 = None;

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or(SignatureError::Malformed)?;
            match key.trim() {
                "ts" => ts = Some(value.trim().to_string()),
                "v1" => v1 = Some(value.trim().to_string()),
                _ => {}
            }
        }

        match (ts, v1) {
            (Some(ts), Some(v1)) if !ts.is_empty() && !v1.is_empty() => Ok(Self { ts, v1 }),
            _ => Err(SignatureError::Malformed),
        }
    }
}

/// Builds the signed string.
pub fn manifest(data_id: Option<&str>, request_id: Option<&str>, ts: &str) -> String {
    let mut manifest = String::new();
    if let Some(id) = data_id.filter(|id| !id.is_empty()) {
        manifest.push_str(&format!("id:{id};"));
    }
    if let Some(request_id) = request_id.filter(|id| !id.is_empty()) {
        manifest.push_str(&format!("request-id:{request_id};"));
    }
    manifest.push_str(&format!("ts:{ts};"));
    manifest
}

/// HMAC-SHA256 of `data` as lowercase hex.
pub fn sign(secret: &str, data: &str) -> String {
    hex::encode(mac(secret, data).finalize().into_bytes())
}

/// Checks an `x-signature` header against the event it came with.
///
/// The digest comparison runs in constant time.
pub fn verify(
    secret: &str,
    header: Option<&str>,
    request_id: Option<&str>,
    data_id: Option<&str>,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NotConfigured);
    }
    let header = SignatureHeader::parse(header.ok_or(SignatureError::Missing)?)?;
    let expected = hex::decode(&header.v1).map_err(|_| SignatureError::Malformed)?;

    mac(secret, &manifest(data_id, request_id, &header.ts))
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn mac(secret: &str, data: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "webhook-secret";

    fn header_for(data_id: Option<&str>, request_id: Option<&str>, ts: &str) -> String {
        let digest = sign(SECRET, &manifest(data_id, request_id, ts));
        format!("ts={ts},v1={digest}")
    }

    #[test]
    fn manifest_skips_missing_segments() {
        assert_eq!(
            manifest(Some("123"), Some("req-1"), "1700000000"),
            "id:123;request-id:req-1;ts:1700000000;"
        );
        assert_eq!(manifest(None, Some("req-1"), "1"), "request-id:req-1;ts:1;");
        assert_eq!(manifest(Some(""), None, "1"), "ts:1;");
    }

    #[test]
    fn sign_matches_rfc_4231_vector() {
        assert_eq!(
            sign("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn valid_signature_is_accepted() {
        let header = header_for(Some("123"), Some("req-1"), "1700000000");
        assert_eq!(verify(SECRET, Some(&header), Some("req-1"), Some("123")), Ok(()));

        // Header parts in either order, with spaces
        let parsed = SignatureHeader::parse(&header).unwrap();
        let swapped = format!("v1={} , ts={}", parsed.v1, parsed.ts);
        assert_eq!(verify(SECRET, Some(&swapped), Some("req-1"), Some("123")), Ok(()));
    }

    #[test]
    fn tampered_events_are_rejected() {
        let header = header_for(Some("123"), Some("req-1"), "1700000000");
        assert_eq!(
            verify(SECRET, Some(&header), Some("req-1"), Some("124")),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, Some(&header), Some("req-2"), Some("123")),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify("other-secret", Some(&header), Some("req-1"), Some("123")),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert_eq!(verify(SECRET, None, None, None), Err(SignatureError::Missing));
        assert_eq!(
            verify(SECRET, Some("garbage"), None, None),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(SECRET, Some("ts=1"), None, None),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(SECRET, Some("ts=1,v1=zz"), None, None),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let header = header_for(None, None, "1");
        assert_eq!(
            verify("", Some(&header), None, None),
            Err(SignatureError::NotConfigured)
        );
    }
}
