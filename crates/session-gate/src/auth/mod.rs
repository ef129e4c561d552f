//! Bearer token authentication.
//!
//! - [`KeySource`] fetches and caches the provider's signing keys
//! - [`TokenVerifier`] checks signature and registered claims
//! - [`SessionCache`] memoizes verification outcomes by token fingerprint
//! - [`AuthGate`] ties them together for each inbound request

pub mod claims;
pub mod gate;
pub mod key_source;
pub mod session_cache;
pub mod verifier;

pub use claims::TokenClaims;
pub use gate::{extract_bearer, AuthDecision, AuthGate, CacheInvalidationPolicy, DenyReason};
pub use key_source::{
    FetchError, HttpKeyFetcher, Jwk, JwksDocument, KeyFetcherTrait, KeySet, KeySource,
    KeySourceConfig, KeyType, SigningKey,
};
pub use session_cache::{CacheEntry, CacheLookup, Fingerprint, SessionCache, SessionCacheConfig};
pub use verifier::{
    FailureKind, TokenVerifier, TokenVerifierTrait, VerificationResult, VerifierConfig,
};
