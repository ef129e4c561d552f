//! Current subject handler.
//!
//! Returns the verified claims of the caller.

use crate::auth::TokenClaims;
use axum::{Extension, Json};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::instrument;

/// Response for `/v1/me`.
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub sub: String,
    pub iss: String,
    pub aud: Vec<String>,
    pub exp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Provider-specific claims (e.g. `sid`, `org_id`).
    pub claims: BTreeMap<String, Value>,
}

impl From<TokenClaims> for MeResponse {
    fn from(claims: TokenClaims) -> Self {
        Self {
            sub: claims.subject,
            iss: claims.issuer,
            aud: claims.audience,
            exp: claims.expires_at,
            iat: claims.issued_at,
            claims: claims.extra,
        }
    }
}

/// Handler for GET /v1/me
///
/// Requires the auth middleware.
///
/// ## Response
///
/// ```json
/// {
///   "sub": "user_2abc",
///   "iss": "https://issuer.test",
///   "aud": ["app"],
///   "exp": 1700003600,
///   "iat": 1700000000,
///   "claims": { "sid": "sess_123" }
/// }
/// ```
#[instrument(skip_all, name = "gate.handlers.me")]
pub async fn get_me(Extension(claims): Extension<TokenClaims>) -> Json<MeResponse> {
    Json(MeResponse::from(claims))
}
