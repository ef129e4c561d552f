//! # Session Gate Test Utilities
//!
//! This crate provides:
//! - Deterministic Ed25519 keypairs and their JWK form
//! - A token builder that signs provider-style session tokens
//! - A wiremock-backed key-set endpoint with request counting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gate_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let key = TestKeypair::new(1, "k1");
//!     let jwks = MockJwksServer::start(&[&key]).await;
//!
//!     let token = TestTokenBuilder::new(&key)
//!         .issuer("https://issuer.test")
//!         .audience("app")
//!         .expires_in_secs(3600)
//!         .build();
//! }
//! ```

pub mod crypto_fixtures;
pub mod jwks_server;
pub mod token_builders;

pub use crypto_fixtures::*;
pub use jwks_server::*;
pub use token_builders::*;
