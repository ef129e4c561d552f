//! Request-facing authorization entry point.
//!
//! Per request:
//!
//! ```text
//! NoToken -> TokenPresent -> cache lookup -> Hit -> Decision
//!                                         -> Miss -> Verifying -> Decision
//!                                                       |
//!                                                       +-> UnknownKey: refresh once, verify once more
//! ```
//!
//! The unknown-key retry happens at most once per request.

use crate::auth::claims::TokenClaims;
use crate::auth::key_source::KeySource;
use crate::auth::session_cache::{CacheLookup, SessionCache};
use crate::auth::verifier::{FailureKind, TokenVerifierTrait, VerificationResult};
use crate::observability::metrics;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use common::secret::{BearerToken, ExposeSecret};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::instrument;

/// What happens to cached results when the provider's key set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheInvalidationPolicy {
    /// Drop all cached results whenever the key-set version changes.
    #[default]
    OnKeySetChange,

    /// Keep cached results until they expire.
    Never,
}

impl CacheInvalidationPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on_key_set_change" | "on-key-set-change" => Some(Self::OnKeySetChange),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    NoCredential,
    Malformed,
    UnsupportedAlgorithm,
    UnknownKey,
    BadSignature,
    Expired,
    NotYetValid,
    WrongIssuer,
    WrongAudience,
}

impl DenyReason {
    /// Stable label; safe to log.
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NoCredential => "no_credential",
            DenyReason::Malformed => FailureKind::Malformed.as_str(),
            DenyReason::UnsupportedAlgorithm => FailureKind::UnsupportedAlgorithm.as_str(),
            DenyReason::UnknownKey => FailureKind::UnknownKey.as_str(),
            DenyReason::BadSignature => FailureKind::BadSignature.as_str(),
            DenyReason::Expired => FailureKind::Expired.as_str(),
            DenyReason::NotYetValid => FailureKind::NotYetValid.as_str(),
            DenyReason::WrongIssuer => FailureKind::WrongIssuer.as_str(),
            DenyReason::WrongAudience => FailureKind::WrongAudience.as_str(),
        }
    }
}

impl From<FailureKind> for DenyReason {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Malformed => DenyReason::Malformed,
            FailureKind::UnsupportedAlgorithm => DenyReason::UnsupportedAlgorithm,
            FailureKind::UnknownKey => DenyReason::UnknownKey,
            FailureKind::BadSignature => DenyReason::BadSignature,
            FailureKind::Expired => DenyReason::Expired,
            FailureKind::NotYetValid => DenyReason::NotYetValid,
            FailureKind::WrongIssuer => DenyReason::WrongIssuer,
            FailureKind::WrongAudience => DenyReason::WrongAudience,
        }
    }
}

/// Authorization outcome for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Allowed(TokenClaims),
    Denied(DenyReason),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allowed(_))
    }
}

impl From<VerificationResult> for AuthDecision {
    fn from(result: VerificationResult) -> Self {
        match result {
            VerificationResult::Valid(claims) => AuthDecision::Allowed(claims),
            VerificationResult::Invalid(kind) => AuthDecision::Denied(kind.into()),
        }
    }
}

/// Extract a bearer token from the `Authorization` header.
///
/// Returns `None` when the header is absent, repeated, not valid ASCII,
/// not the `Bearer` scheme (case-insensitive), or the token is empty or
/// contains whitespace.
pub fn extract_bearer(headers: &HeaderMap) -> Option<BearerToken> {
    let mut values = headers.get_all(AUTHORIZATION).iter();
    let value = values.next()?;
    if values.next().is_some() {
        return None;
    }

    let (scheme, token) = value.to_str().ok()?.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }

    Some(BearerToken::new(token.to_string()))
}

/// Request-facing authorizer: cache first, verifier second.
pub struct AuthGate {
    key_source: KeySource,
    verifier: Arc<dyn TokenVerifierTrait>,
    cache: Arc<SessionCache>,
    audience: String,
    policy: CacheInvalidationPolicy,
    seen_key_set_version: AtomicU64,
}

impl AuthGate {
    pub fn new(
        key_source: KeySource,
        verifier: Arc<dyn TokenVerifierTrait>,
        cache: Arc<SessionCache>,
        audience: String,
        policy: CacheInvalidationPolicy,
    ) -> Self {
        let seen = key_source.version();
        Self {
            key_source,
            verifier,
            cache,
            audience,
            policy,
            seen_key_set_version: AtomicU64::new(seen),
        }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    /// Authorize a request by its headers.
    pub async fn authorize(&self, headers: &HeaderMap) -> AuthDecision {
        match extract_bearer(headers) {
            Some(token) => self.authorize_token(&token).await,
            None => {
                tracing::debug!(target: "gate.auth.gate", "No bearer credential on request");
                metrics::record_auth_decision("denied", DenyReason::NoCredential.as_str());
                AuthDecision::Denied(DenyReason::NoCredential)
            }
        }
    }

    /// Authorize an already-extracted bearer token.
    #[instrument(skip_all)]
    pub async fn authorize_token(&self, token: &BearerToken) -> AuthDecision {
        let raw = token.expose_secret();

        self.sync_key_set_version();
        if let CacheLookup::Hit(result) = self.cache.lookup(raw) {
            metrics::record_session_cache("hit");
            return self.finish(result, true);
        }
        metrics::record_session_cache("miss");

        let mut version = self.key_source.version();
        let mut result = self.verifier.verify(raw, &self.audience).await;

        if result == VerificationResult::Invalid(FailureKind::UnknownKey) {
            tracing::debug!(target: "gate.auth.gate", "Unknown key, refreshing key set once");
            if let Err(e) = self.key_source.refresh().await {
                tracing::warn!(
                    target: "gate.auth.gate",
                    error = %e,
                    "Key-set refresh after unknown key failed"
                );
            }
            version = self.sync_key_set_version();
            result = self.verifier.verify(raw, &self.audience).await;
        }

        // A result computed against an older key set is not cached
        let key_source = &self.key_source;
        let stored = self
            .cache
            .store_if(raw, result.clone(), Utc::now(), || key_source.version() == version);
        if !stored && self.key_source.version() != version {
            tracing::debug!(
                target: "gate.auth.gate",
                "Key set changed during verification, not caching result"
            );
        }

        self.finish(result, false)
    }

    /// Apply the invalidation policy if the key set changed since last seen.
    /// Returns the current version.
    fn sync_key_set_version(&self) -> u64 {
        let current = self.key_source.version();
        let seen = self.seen_key_set_version.swap(current, Ordering::AcqRel);
        if seen != current && self.policy == CacheInvalidationPolicy::OnKeySetChange {
            tracing::info!(
                target: "gate.auth.gate",
                previous_version = seen,
                version = current,
                "Key set changed, invalidating session cache"
            );
            self.cache.invalidate_all();
            metrics::record_session_cache("invalidated");
        }
        current
    }

    fn finish(&self, result: VerificationResult, cached: bool) -> AuthDecision {
        let decision = AuthDecision::from(result);
        match &decision {
            AuthDecision::Allowed(_) => {
                metrics::record_auth_decision("allowed", "none");
            }
            AuthDecision::Denied(reason) => {
                tracing::debug!(
                    target: "gate.auth.gate",
                    reason = reason.as_str(),
                    cached = cached,
                    "Request denied"
                );
                metrics::record_auth_decision("denied", reason.as_str());
            }
        }
        decision
    }
}
