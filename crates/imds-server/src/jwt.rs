//! Best-effort expiry extraction from the projected token.
//!
//! The token is usually a JWT, but nothing here depends on that: the expiry
//! is advisory, so any malformation simply yields `None` and the raw token is
//! still served. The content is never validated; this sidecar is a passive
//! vehicle for the credential.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: i64,
}

/// Extract the `exp` claim from a three-segment base64url token.
///
/// Returns `None` when the token is not shaped like a JWT, the payload does
/// not decode, the claims are not JSON, or `exp` is absent or zero.
pub fn token_expiration(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let _signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    if claims.exp == 0 {
        return None;
    }
    DateTime::from_timestamp(claims.exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload(json: &str) -> String {
        URL_SAFE_NO_PAD.encode(json.as_bytes())
    }

    #[test]
    fn extracts_exp_from_well_formed_token() {
        let token = format!("e30.{}.sig", encode_payload(r#"{"exp":1700000000}"#));
        let exp = token_expiration(&token).expect("should extract expiry");
        assert_eq!(exp, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        assert_eq!(exp.to_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn extra_claims_are_ignored() {
        let payload = r#"{"iss":"kubernetes","exp":1700000000,"sub":"system:serviceaccount:ns:sa"}"#;
        let token = format!("e30.{}.sig", encode_payload(payload));
        assert!(token_expiration(&token).is_some());
    }

    #[test]
    fn wrong_segment_count_yields_none() {
        assert!(token_expiration("not-a-jwt").is_none());
        assert!(token_expiration("a.b").is_none());
        assert!(token_expiration("a.b.c.d").is_none());
        assert!(token_expiration("").is_none());
    }

    #[test]
    fn invalid_base64_yields_none() {
        assert!(token_expiration("e30.!!!not-base64!!!.sig").is_none());
    }

    #[test]
    fn non_json_payload_yields_none() {
        let token = format!("e30.{}.sig", URL_SAFE_NO_PAD.encode(b"plain text"));
        assert!(token_expiration(&token).is_none());
    }

    #[test]
    fn missing_or_zero_exp_yields_none() {
        let token = format!("e30.{}.sig", encode_payload(r#"{"iss":"kubernetes"}"#));
        assert!(token_expiration(&token).is_none());

        let token = format!("e30.{}.sig", encode_payload(r#"{"exp":0}"#));
        assert!(token_expiration(&token).is_none());
    }
}
