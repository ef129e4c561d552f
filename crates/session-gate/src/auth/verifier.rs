//! Bearer token verification.
//!
//! Checks run in a fixed order so the failure kind for any given token is
//! deterministic:
//!
//! 1. Structure (size, three segments, JSON header and payload, `kid`)
//! 2. Algorithm allow-list
//! 3. Key lookup by `kid`
//! 4. Signature
//! 5. `exp`
//! 6. `nbf` and `iat`
//! 7. `iss`
//! 8. `aud`
//!
//! Claim checks only run after the signature has verified.

use crate::auth::claims::TokenClaims;
use crate::auth::key_source::KeySource;
use crate::observability::metrics;
use common::jwt::{
    decode_json_segment, header_kid, split_token, unix_now, validate_exp_at,
    validate_not_before_at, DEFAULT_CLOCK_SKEW,
};
use jsonwebtoken::Algorithm;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Algorithms accepted when none are configured explicitly.
pub const DEFAULT_ALLOWED_ALGORITHMS: [Algorithm; 3] =
    [Algorithm::RS256, Algorithm::ES256, Algorithm::EdDSA];

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Malformed,
    UnsupportedAlgorithm,
    UnknownKey,
    BadSignature,
    Expired,
    NotYetValid,
    WrongIssuer,
    WrongAudience,
}

impl FailureKind {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Malformed => "malformed",
            FailureKind::UnsupportedAlgorithm => "unsupported_algorithm",
            FailureKind::UnknownKey => "unknown_key",
            FailureKind::BadSignature => "bad_signature",
            FailureKind::Expired => "expired",
            FailureKind::NotYetValid => "not_yet_valid",
            FailureKind::WrongIssuer => "wrong_issuer",
            FailureKind::WrongAudience => "wrong_audience",
        }
    }
}

/// Outcome of verifying one token.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Valid(TokenClaims),
    Invalid(FailureKind),
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid(_))
    }

    /// Label for logs and metrics ("valid" or the failure kind).
    pub fn label(&self) -> &'static str {
        match self {
            VerificationResult::Valid(_) => "valid",
            VerificationResult::Invalid(kind) => kind.as_str(),
        }
    }
}

/// Token verification, injectable so the gate can be tested with fakes.
#[async_trait::async_trait]
pub trait TokenVerifierTrait: Send + Sync {
    async fn verify(&self, raw_token: &str, expected_audience: &str) -> VerificationResult;
}

/// Verifier settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Required `iss` value.
    pub issuer: String,

    /// Algorithms a token header may name. HMAC algorithms are never honoured.
    pub allowed_algorithms: Vec<Algorithm>,

    /// Tolerance applied to `exp`, `nbf` and `iat`.
    pub clock_skew: Duration,
}

impl VerifierConfig {
    /// Config with the default algorithm allow-list and clock skew.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            allowed_algorithms: DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }
}

/// Verifies provider-issued bearer tokens against keys from a [`KeySource`].
pub struct TokenVerifier {
    key_source: KeySource,
    config: VerifierConfig,
}

impl TokenVerifier {
    pub fn new(key_source: KeySource, config: VerifierConfig) -> Self {
        Self { key_source, config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    fn algorithm_allowed(&self, alg: Algorithm) -> bool {
        !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
            && self.config.allowed_algorithms.contains(&alg)
    }

    /// Verify `raw_token` against `now` (Unix seconds).
    ///
    /// The token contents are never logged.
    pub async fn verify_at(
        &self,
        raw_token: &str,
        expected_audience: &str,
        now: i64,
    ) -> VerificationResult {
        match self.check(raw_token, expected_audience, now).await {
            Ok(claims) => VerificationResult::Valid(claims),
            Err(kind) => {
                tracing::debug!(
                    target: "gate.auth.verifier",
                    reason = kind.as_str(),
                    "Token rejected"
                );
                VerificationResult::Invalid(kind)
            }
        }
    }

    async fn check(
        &self,
        raw_token: &str,
        expected_audience: &str,
        now: i64,
    ) -> Result<TokenClaims, FailureKind> {
        // 1. Structure
        let parts = split_token(raw_token).map_err(|_| FailureKind::Malformed)?;
        let header = decode_json_segment(parts.header).map_err(|_| FailureKind::Malformed)?;
        let payload = decode_json_segment(parts.payload).map_err(|_| FailureKind::Malformed)?;
        let kid = header_kid(&header).map_err(|_| FailureKind::Malformed)?;
        let unverified = TokenClaims::from_payload(payload).map_err(|e| {
            tracing::debug!(target: "gate.auth.verifier", error = %e, "Token payload rejected");
            FailureKind::Malformed
        })?;

        // 2. Algorithm allow-list
        let alg = header
            .get("alg")
            .and_then(serde_json::Value::as_str)
            .ok_or(FailureKind::Malformed)?;
        let alg = Algorithm::from_str(alg).map_err(|_| FailureKind::UnsupportedAlgorithm)?;
        if !self.algorithm_allowed(alg) {
            return Err(FailureKind::UnsupportedAlgorithm);
        }

        // 3. Key
        let key = self
            .key_source
            .get_key(&kid)
            .await
            .ok_or(FailureKind::UnknownKey)?;
        if !key.accepts(alg) {
            tracing::debug!(
                target: "gate.auth.verifier",
                kid = %kid,
                alg = ?alg,
                key_type = ?key.key_type(),
                "Token algorithm does not fit key"
            );
            return Err(FailureKind::UnsupportedAlgorithm);
        }

        // 4. Signature
        match jsonwebtoken::crypto::verify(
            parts.signature,
            parts.signing_input.as_bytes(),
            key.material(),
            alg,
        ) {
            Ok(true) => {}
            Ok(false) => return Err(FailureKind::BadSignature),
            Err(e) => {
                tracing::debug!(target: "gate.auth.verifier", error = %e, "Signature check errored");
                return Err(FailureKind::BadSignature);
            }
        }
        let claims = unverified;

        // 5-6. Time window
        let skew = self.config.clock_skew;
        validate_exp_at(claims.expires_at, skew, now).map_err(|_| FailureKind::Expired)?;
        for bound in [claims.not_before, claims.issued_at].into_iter().flatten() {
            validate_not_before_at(bound, skew, now).map_err(|_| FailureKind::NotYetValid)?;
        }

        // 7. Issuer
        if claims.issuer != self.config.issuer {
            return Err(FailureKind::WrongIssuer);
        }

        // 8. Audience
        if !claims.has_audience(expected_audience) {
            return Err(FailureKind::WrongAudience);
        }

        Ok(claims)
    }
}

#[async_trait::async_trait]
impl TokenVerifierTrait for TokenVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, raw_token: &str, expected_audience: &str) -> VerificationResult {
        let start = Instant::now();
        let result = self.verify_at(raw_token, expected_audience, unix_now()).await;
        metrics::record_token_verification(start.elapsed(), result.label());
        result
    }
}
