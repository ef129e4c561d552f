//! Session Gate error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl.
//! Messages returned to clients are generic; the specific deny reason is
//! logged server-side only.

use crate::auth::DenyReason;
use axum::{
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Challenge sent when the request carried no credential.
pub const BEARER_CHALLENGE: &str = "Bearer realm=\"session-gate\"";

/// Challenge sent when a credential was presented and rejected.
pub const INVALID_TOKEN_CHALLENGE: &str =
    "Bearer realm=\"session-gate\", error=\"invalid_token\"";

/// Service-level error type.
///
/// Every gate denial maps to 401 Unauthorized.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Unauthorized: {}", .0.as_str())]
    Unauthorized(DenyReason),
}

impl GateError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // RFC 6750 3.1: no error code when no credential was presented
        let (code, message, challenge) = match self {
            GateError::Unauthorized(DenyReason::NoCredential) => {
                ("UNAUTHORIZED", "Authentication required", BEARER_CHALLENGE)
            }
            GateError::Unauthorized(_) => (
                "INVALID_TOKEN",
                "The access token is invalid or expired",
                INVALID_TOKEN_CHALLENGE,
            ),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static(challenge));

        response
    }
}
