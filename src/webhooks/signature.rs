//! HMAC-SHA256 signatures for payment processor callbacks.
//!
//! Two header layouts are accepted: `Stripe-Signature: t=<unix>,v1=<hex>` and
//! the generic `x-timestamp` / `x-signature` pair. Both sign `"{t}.{body}"`.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature headers")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Produces the hex signature for a payload.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = keyed(secret);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Builds a `Stripe-Signature` header value for a payload.
pub fn stripe_signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, body))
}

/// Verifies callback headers against the raw body.
pub fn verify(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), SignatureError> {
    let (timestamp, candidates) = extract(headers)?;

    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    for candidate in candidates {
        let Ok(raw) = hex::decode(candidate.trim()) else {
            continue;
        };
        let mut mac = keyed(secret);
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&raw).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

fn keyed(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length; the error arm is unreachable.
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    }
}

fn extract(headers: &HeaderMap) -> Result<(i64, Vec<String>), SignatureError> {
    if let Some(value) = headers.get(STRIPE_SIGNATURE_HEADER) {
        let value = value.to_str().map_err(|_| SignatureError::Malformed)?;
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in value.split(',') {
            match part.trim().split_once('=') {
                Some(("t", ts)) => timestamp = ts.parse::<i64>().ok(),
                Some(("v1", sig)) => signatures.push(sig.to_string()),
                _ => {}
            }
        }
        return match (timestamp, signatures.is_empty()) {
            (Some(ts), false) => Ok((ts, signatures)),
            _ => Err(SignatureError::Malformed),
        };
    }

    match (headers.get(TIMESTAMP_HEADER), headers.get(SIGNATURE_HEADER)) {
        (Some(ts), Some(sig)) => {
            let ts = ts
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or(SignatureError::Malformed)?;
            let sig = sig.to_str().map_err(|_| SignatureError::Malformed)?;
            Ok((ts, vec![sig.to_string()]))
        }
        _ => Err(SignatureError::Missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    fn stripe_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(STRIPE_SIGNATURE_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_stripe_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = stripe_headers(&stripe_signature_header(SECRET, NOW, body));
        assert_eq!(verify(&headers, body, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn accepts_generic_header_pair() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from(NOW));
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_payload(SECRET, NOW, body)).unwrap(),
        );
        assert_eq!(verify(&headers, body, SECRET, 300, NOW + 10), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let headers = stripe_headers(&stripe_signature_header(SECRET, NOW, b"original"));
        assert_eq!(
            verify(&headers, b"tampered", SECRET, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = b"payload";
        let headers = stripe_headers(&stripe_signature_header("other", NOW, body));
        assert_eq!(
            verify(&headers, body, SECRET, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let body = b"payload";
        let headers = stripe_headers(&stripe_signature_header(SECRET, NOW, body));
        assert_eq!(
            verify(&headers, body, SECRET, 300, NOW + 301),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn missing_and_malformed_headers() {
        assert_eq!(
            verify(&HeaderMap::new(), b"", SECRET, 300, NOW),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify(&stripe_headers("v1=abcd"), b"", SECRET, 300, NOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn any_matching_v1_entry_is_enough() {
        let body = b"payload";
        let good = sign_payload(SECRET, NOW, body);
        let headers = stripe_headers(&format!("t={},v1=deadbeef,v1={}", NOW, good));
        assert_eq!(verify(&headers, body, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn extreme_timestamps_are_expired_not_overflowing() {
        let body = b"payload";
        for t in [i64::MIN, i64::MAX] {
            let headers = stripe_headers(&format!("t={},v1=deadbeef", t));
            assert_eq!(
                verify(&headers, body, SECRET, 300, NOW),
                Err(SignatureError::Expired)
            );
        }
        let headers = stripe_headers(&format!("t={},v1=deadbeef", i64::MAX));
        assert_eq!(
            verify(&headers, body, SECRET, 300, i64::MIN),
            Err(SignatureError::Expired)
        );
    }
}
