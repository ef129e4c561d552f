//! JWT primitives shared across Session Gate crates.
//!
//! This module provides the structural layer of token handling:
//! - Size limits for DoS prevention
//! - Clock skew constants and time-window checks
//! - Compact-serialization splitting and base64url segment decoding
//! - Public key material decoding helpers
//!
//! Nothing in this module verifies a signature. Callers MUST verify the
//! signature over [`TokenParts::signing_input`] before trusting any decoded
//! payload field.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Error messages are generic; detail goes to debug logs only
//! - Raw token contents are never logged
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{split_token, decode_json_segment, validate_exp_at, DEFAULT_CLOCK_SKEW};
//!
//! let parts = split_token(token)?;
//! let header = decode_json_segment(parts.header)?;
//! // ... verify signature over parts.signing_input ...
//! validate_exp_at(exp, DEFAULT_CLOCK_SKEW, now)?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before any base64 decoding or
/// cryptographic work. Typical provider session tokens are 500-1500 bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance (5 seconds).
///
/// Applied symmetrically to `exp`, `nbf` and `iat` checks.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Maximum allowed clock skew tolerance (10 minutes).
///
/// Configuration above this value is rejected.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Structural problems with a compact JWT.
///
/// Display strings are intentionally identical so they can be returned to
/// clients without revealing which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenFormatError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not three dot-separated base64url segments of JSON.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token header has no usable `kid`.
    #[error("The access token is invalid or expired")]
    MissingKid,
}

/// Time-window violations for registered time claims.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindowError {
    /// `exp` is at or before `now - skew`.
    #[error("token expired")]
    Expired,

    /// `nbf` or `iat` is after `now + skew`.
    #[error("token not yet valid")]
    NotYetValid,
}

// =============================================================================
// Token structure
// =============================================================================

/// The three segments of a compact JWT, borrowed from the raw token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    /// Base64url header segment.
    pub header: &'a str,

    /// Base64url payload segment.
    pub payload: &'a str,

    /// Base64url signature segment.
    pub signature: &'a str,

    /// `header.payload`, the bytes the signature covers.
    pub signing_input: &'a str,
}

/// Split a compact JWT into its segments.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if the token is not exactly three non-empty segments
pub fn split_token(token: &str) -> Result<TokenParts<'_>, TokenFormatError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(TokenFormatError::TokenTooLarge);
    }

    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(TokenFormatError::MalformedToken);
    };

    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        tracing::debug!(target: "common.jwt", "Token rejected: empty JWT segment");
        return Err(TokenFormatError::MalformedToken);
    }

    // header.len() + 1 + payload.len() always lands on the second '.'
    let signing_input = token
        .get(..header.len() + 1 + payload.len())
        .ok_or(TokenFormatError::MalformedToken)?;

    Ok(TokenParts {
        header,
        payload,
        signature,
        signing_input,
    })
}

/// Decode a base64url segment into a JSON object.
///
/// # Errors
///
/// Returns `MalformedToken` if the segment is not base64url, not JSON, or
/// not a JSON object.
pub fn decode_json_segment(segment: &str) -> Result<Map<String, Value>, TokenFormatError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT segment base64");
        TokenFormatError::MalformedToken
    })?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => {
            tracing::debug!(target: "common.jwt", "JWT segment is not a JSON object");
            Err(TokenFormatError::MalformedToken)
        }
        Err(e) => {
            tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT segment JSON");
            Err(TokenFormatError::MalformedToken)
        }
    }
}

/// Extract the `kid` (key ID) from a decoded JWT header.
///
/// Empty strings and non-string values are rejected.
///
/// # Errors
///
/// Returns `MissingKid` when the header has no usable `kid`.
pub fn header_kid(header: &Map<String, Value>) -> Result<String, TokenFormatError> {
    header
        .get("kid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(TokenFormatError::MissingKid)
}

/// Read a NumericDate claim (RFC 7519 section 2).
///
/// Integers are taken as-is; fractional values are truncated toward zero.
/// Returns `None` for any other JSON type or out-of-range values.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn numeric_date(value: &Value) -> Option<i64> {
    if let Some(secs) = value.as_i64() {
        return Some(secs);
    }
    let secs = value.as_f64()?;
    if secs.is_finite() && secs.abs() < i64::MAX as f64 {
        Some(secs.trunc() as i64)
    } else {
        None
    }
}

// =============================================================================
// Time windows
// =============================================================================

fn skew_secs(clock_skew: Duration) -> i64 {
    i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX)
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Check `exp` against `now` with clock skew tolerance.
///
/// A token is live while `exp + skew > now`.
///
/// # Errors
///
/// Returns `TimeWindowError::Expired` otherwise.
pub fn validate_exp_at(exp: i64, clock_skew: Duration, now: i64) -> Result<(), TimeWindowError> {
    if exp.saturating_add(skew_secs(clock_skew)) > now {
        Ok(())
    } else {
        tracing::debug!(
            target: "common.jwt",
            exp = exp,
            now = now,
            clock_skew_secs = clock_skew.as_secs(),
            "Token rejected: expired"
        );
        Err(TimeWindowError::Expired)
    }
}

/// Check a lower time bound (`nbf` or `iat`) against `now` with clock skew.
///
/// The bound is satisfied while `bound <= now + skew`.
///
/// # Errors
///
/// Returns `TimeWindowError::NotYetValid` otherwise.
pub fn validate_not_before_at(
    bound: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), TimeWindowError> {
    let max_allowed = now.saturating_add(skew_secs(clock_skew));
    if bound > max_allowed {
        tracing::debug!(
            target: "common.jwt",
            bound = bound,
            now = now,
            max_allowed = max_allowed,
            "Token rejected: not yet valid"
        );
        return Err(TimeWindowError::NotYetValid);
    }
    Ok(())
}

// =============================================================================
// Key material
// =============================================================================

/// Decode an Ed25519 public key from a JWK `x` field (base64url, no padding).
///
/// # Errors
///
/// Returns `base64::DecodeError` if the value is not valid base64url.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(x_b64url)
}

// =============================================================================
// Tests
// =============================================================================
