//! Timestamped HMAC-SHA256 signatures for inbound webhooks.
//!
//! Header format: `t=<unix-seconds>,v1=<hex-hmac>[,v1=<hex-hmac>...][,v0=...]`.
//! The signed message is `"<t>.<raw body>"`. Unknown schemes (such as the
//! legacy `v0`) are ignored; any matching `v1` entry is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and the local clock.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing the {0} component")]
    MissingComponent(&'static str),

    #[error("signature timestamp is not a unix timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("signature timestamp is outside the tolerance window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: u64 },

    #[error("signature mismatch")]
    Mismatch,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

impl SignatureError {
    /// True when the request itself is malformed rather than forged or replayed.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            SignatureError::MissingComponent(_) | SignatureError::InvalidTimestamp(_)
        )
    }
}

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

pub fn parse_signature_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value.to_string()),
            "v1" if !value.is_empty() => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let raw = timestamp
        .filter(|t| !t.is_empty())
        .ok_or(SignatureError::MissingComponent("t"))?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingComponent("v1"));
    }
    let timestamp = raw
        .parse::<i64>()
        .map_err(|_| SignatureError::InvalidTimestamp(raw.clone()))?;

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Generate the hex-encoded `v1` signature for `payload` signed at `timestamp`.
pub fn generate_timestamped_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against the raw payload.
///
/// `now` is the local unix time in seconds; the timestamp may deviate from it
/// by at most `tolerance_secs` in either direction.
pub fn verify_timestamped_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<SignatureHeader, SignatureError> {
    let parsed = parse_signature_header(header)?;

    let skew_secs = now.abs_diff(parsed.timestamp);
    if skew_secs > tolerance_secs.unsigned_abs() {
        return Err(SignatureError::StaleTimestamp { skew_secs });
    }

    let expected = generate_timestamped_signature(secret, parsed.timestamp, payload)?;
    let expected_bytes = expected.as_bytes();

    let matched = parsed.signatures.iter().any(|candidate| {
        let candidate = candidate.as_bytes();
        candidate.len() == expected_bytes.len() && bool::from(candidate.ct_eq(expected_bytes))
    });

    if matched {
        Ok(parsed)
    } else {
        Err(SignatureError::Mismatch)
    }
}
