//! Session Gate Library
//!
//! Server-side verification of identity-provider bearer tokens with
//! in-memory caching of both signing keys and verification outcomes.
//!
//! # Architecture
//!
//! Requests flow leaf-ward through four components:
//!
//! ```text
//! AuthGate -> SessionCache (fast path)
//!          -> TokenVerifier (slow path) -> KeySource (signing keys, refreshed lazily)
//! ```
//!
//! # Modules
//!
//! - `auth` - Key source, verifier, session cache and the gate itself
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `middleware` - Axum middleware wrapping the gate
//! - `tasks` - Background key refresh and cache sweep
//! - `observability` - Prometheus metrics
//! - `handlers` / `routes` - HTTP surface of the binary

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod routes;
pub mod tasks;
