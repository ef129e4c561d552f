//! Authorization middleware for protected routes.
//!
//! Runs the [`AuthGate`] on every request and injects the verified
//! [`TokenClaims`] into request extensions.

use crate::auth::{AuthDecision, AuthGate, TokenClaims};
use crate::errors::GateError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::instrument;

/// State for the authorization middleware.
#[derive(Clone)]
pub struct AuthState {
    /// Gate shared by all protected routes.
    pub gate: Arc<AuthGate>,
}

/// Middleware that admits only requests carrying a valid bearer token.
///
/// # Authorization Header Format
///
/// ```text
/// Authorization: Bearer <token>
/// ```
///
/// # Response
///
/// - 401 Unauthorized with `WWW-Authenticate` if the token is missing or invalid
/// - Otherwise continues with the claims in request extensions
#[instrument(skip_all, name = "gate.middleware.auth")]
pub async fn require_auth(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, GateError> {
    match state.gate.authorize(req.headers()).await {
        AuthDecision::Allowed(claims) => {
            req.extensions_mut().insert(claims);
            Ok(next.run(req).await)
        }
        AuthDecision::Denied(reason) => {
            tracing::debug!(
                target: "gate.middleware.auth",
                reason = reason.as_str(),
                "Rejecting request"
            );
            Err(GateError::Unauthorized(reason))
        }
    }
}

/// Extension trait for reading verified claims from a request.
pub trait ClaimsExt {
    /// Returns `None` if the auth middleware was not applied to this request.
    fn claims(&self) -> Option<&TokenClaims>;
}

impl<B> ClaimsExt for axum::extract::Request<B> {
    fn claims(&self) -> Option<&TokenClaims> {
        self.extensions().get::<TokenClaims>()
    }
}
