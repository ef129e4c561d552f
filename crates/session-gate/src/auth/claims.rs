//! Verified token claims.
//!
//! Well-known registered claims are strongly typed; everything else the
//! provider puts in the payload is kept in an open `extra` map. The
//! `subject` is redacted in Debug output to keep user identifiers out of logs.

use common::jwt::numeric_date;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Registered claim names that are lifted out of the payload.
const REGISTERED_CLAIMS: [&str; 6] = ["sub", "iss", "aud", "exp", "nbf", "iat"];

/// A payload that cannot be turned into [`TokenClaims`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimsError {
    /// A required claim is absent.
    #[error("missing required claim: {0}")]
    Missing(&'static str),

    /// A claim has the wrong JSON type.
    #[error("claim has invalid type: {0}")]
    InvalidType(&'static str),
}

/// Claims of a successfully verified token.
///
/// Instances are only handed out by the verifier after the signature and
/// every registered-claim check has passed; they are immutable afterwards.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (`sub`) - redacted in Debug output.
    pub subject: String,

    /// Issuer (`iss`).
    pub issuer: String,

    /// Audience (`aud`); a single string in the token becomes one entry.
    pub audience: Vec<String>,

    /// Issued-at (`iat`, Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,

    /// Expiration (`exp`, Unix epoch seconds).
    pub expires_at: i64,

    /// Not-before (`nbf`, Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,

    /// Provider-specific claims (e.g. `sid`, `azp`, `org_id`).
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl fmt::Debug for TokenClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenClaims")
            .field("subject", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("not_before", &self.not_before)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenClaims {
    /// Build claims from a decoded JWT payload.
    ///
    /// `sub`, `iss` and `exp` are required. `aud` may be absent (the
    /// audience check will then fail), a string, or an array of strings.
    ///
    /// # Errors
    ///
    /// Returns `ClaimsError` when a required claim is missing or a
    /// registered claim has the wrong type.
    pub fn from_payload(mut payload: Map<String, Value>) -> Result<Self, ClaimsError> {
        let subject = required_string(&payload, "sub")?;
        let issuer = required_string(&payload, "iss")?;
        let audience = audience(payload.get("aud"))?;

        let expires_at = payload
            .get("exp")
            .ok_or(ClaimsError::Missing("exp"))
            .and_then(|v| numeric_date(v).ok_or(ClaimsError::InvalidType("exp")))?;
        let not_before = optional_date(&payload, "nbf")?;
        let issued_at = optional_date(&payload, "iat")?;

        for name in REGISTERED_CLAIMS {
            payload.remove(name);
        }

        Ok(Self {
            subject,
            issuer,
            audience,
            issued_at,
            expires_at,
            not_before,
            extra: payload.into_iter().collect(),
        })
    }

    /// Whether `aud` contains the given audience.
    pub fn has_audience(&self, audience: &str) -> bool {
        self.audience.iter().any(|a| a == audience)
    }

    /// Look up a provider-specific claim.
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Look up a provider-specific claim as a string.
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

fn required_string(payload: &Map<String, Value>, name: &'static str) -> Result<String, ClaimsError> {
    match payload.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ClaimsError::InvalidType(name)),
        None => Err(ClaimsError::Missing(name)),
    }
}

fn optional_date(payload: &Map<String, Value>, name: &'static str) -> Result<Option<i64>, ClaimsError> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => numeric_date(v)
            .map(Some)
            .ok_or(ClaimsError::InvalidType(name)),
    }
}

fn audience(value: Option<&Value>) -> Result<Vec<String>, ClaimsError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .ok_or(ClaimsError::InvalidType("aud"))
            })
            .collect(),
        Some(_) => Err(ClaimsError::InvalidType("aud")),
    }
}
