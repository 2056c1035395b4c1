//! AK/SK request signing
//!
//! A signed request carries `Authorization: <accessKey>:<signature>` and an
//! RFC-1123 `X-Request-Date`. The signature is
//! `base64(HMAC-SHA1(secretKey, lower(method \n date \n path \n sortedQuery)))`
//! where `sortedQuery` is the raw query split on `&`, sorted and re-joined.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::Duration;

use crate::error::{AuthzError, Result};

type HmacSha1 = Hmac<Sha1>;

/// Split an `accessKey:signature` header value
pub fn parse_authorization(header: &str) -> Result<(&str, &str)> {
    let mut parts = header.trim().split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ak), Some(signature), None) if !ak.is_empty() && !signature.is_empty() => {
            Ok((ak, signature))
        }
        _ => Err(AuthzError::bad_request(
            "Authorization header must be <accessKey>:<signature>",
        )),
    }
}

/// Parse an RFC-1123 request date (`Tue, 15 Nov 1994 08:12:31 GMT`)
pub fn parse_request_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| AuthzError::bad_request(format!("Invalid request date {}: {}", raw, e)))
}

/// Format a date the way signing clients send it
pub fn format_request_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Time left before a request dated `date` falls outside the allowed skew
///
/// Returns `Unauthorized` once `date + skew` is in the past.
pub fn remaining_validity(date: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> Result<Duration> {
    let skew = chrono::Duration::from_std(skew)
        .map_err(|_| AuthzError::Config("request date offset out of range".to_string()))?;
    let deadline = date + skew;
    if deadline < now {
        return Err(AuthzError::unauthorized("Request date has expired"));
    }
    Ok((deadline - now).to_std().unwrap_or(Duration::ZERO))
}

/// Sort raw `k=v` pairs; an absent query canonicalizes to `""`
pub fn sort_query(query: Option<&str>) -> String {
    let mut params: Vec<&str> = query.unwrap_or("").split('&').collect();
    params.sort_unstable();
    params.join("&")
}

/// Lower-cased string the signature is computed over
pub fn canonical_string(method: &str, date: &str, path: &str, query: Option<&str>) -> String {
    format!("{}\n{}\n{}\n{}", method, date, path, sort_query(query)).to_lowercase()
}

/// Base64 HMAC-SHA1 of `canonical` under `secret_key`
pub fn sign(secret_key: &str, canonical: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(secret_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(canonical.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Compare a supplied signature against the expected one, ignoring case
pub fn verify(secret_key: &str, canonical: &str, signature: &str) -> bool {
    let expected = sign(secret_key, canonical);
    !expected.is_empty() && expected.eq_ignore_ascii_case(signature.trim())
}
