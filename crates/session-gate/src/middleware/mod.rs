//! HTTP middleware for Session Gate.
//!
//! # Components
//!
//! - `auth` - Bearer-token authorization for protected routes
//! - `http_metrics` - Request/response metrics for every route

pub mod auth;
pub mod http_metrics;

pub use auth::{require_auth, AuthState, ClaimsExt};
pub use http_metrics::http_metrics_middleware;
