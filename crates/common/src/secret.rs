//! Secret wrappers for bearer credentials.
//!
//! A raw bearer token grants the privileges of its subject to whoever holds
//! it, so it must never reach a log line, a span field, or a panic message.
//! This module re-exports [`secrecy`] and adds [`BearerToken`], the type the
//! request extractor hands to the rest of the pipeline.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{BearerToken, ExposeSecret};
//!
//! let token = BearerToken::new("eyJhbGciOi...".to_string());
//!
//! // Debug output is redacted
//! assert!(!format!("{token:?}").contains("eyJ"));
//!
//! // Callers that really need the bytes must ask for them explicitly
//! assert!(token.expose_secret().starts_with("eyJ"));
//! ```

use std::fmt;

pub use secrecy::{ExposeSecret, SecretString};

/// A bearer token extracted from an inbound request.
///
/// Wraps a [`SecretString`] so that deriving `Debug` on any structure that
/// carries a token stays safe.
#[derive(Clone)]
pub struct BearerToken(SecretString);

impl BearerToken {
    /// Wrap a raw token string.
    #[must_use]
    pub fn new(raw: String) -> Self {
        Self(SecretString::from(raw))
    }
}

impl ExposeSecret<str> for BearerToken {
    fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BearerToken").field(&"[REDACTED]").finish()
    }
}
