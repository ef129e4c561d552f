//! Signing key source backed by the provider's published key set.
//!
//! The key source fetches the identity provider's JWKS document and keeps
//! the parsed keys in an immutable [`KeySet`] snapshot. Readers clone an
//! `Arc<KeySet>` and never observe a partially-updated set.
//!
//! # Refresh rules
//!
//! - At most one fetch is in flight; concurrent callers wait for it and
//!   share its outcome.
//! - A refresh attempted before `next_refresh_earliest` is a no-op that
//!   returns the current snapshot. `next_refresh_earliest` strictly
//!   increases with every attempt, successful or not.
//! - A failed or timed-out fetch keeps the previous keys (fail-open for
//!   keys already cached, fail-closed for unknown ones).
//! - Fetches run on a detached task so a cancelled request cannot abort
//!   a refresh other requests are waiting on.

use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::jwt::decode_ed25519_public_key_jwk;
use jsonwebtoken::{Algorithm, DecodingKey};
use ring::digest::{digest, SHA256};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// Default minimum interval between two key-set fetches.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default age after which a key set is considered stale (5 minutes).
pub const DEFAULT_KEY_MAX_AGE: Duration = Duration::from_secs(300);

/// Default bound on a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of retired keys remembered for diagnostics.
const MAX_RETIRED_KEYS: usize = 16;

/// Stand-in for "never" when an instant would overflow (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + duration`, saturating at a far-future instant instead of
/// panicking on overflow.
pub(crate) fn instant_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

// =============================================================================
// Key-set document
// =============================================================================

/// JSON Web Key from the provider's key-set endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC" or "OKP").
    pub kty: String,

    /// Key ID - used to select the correct key for verification.
    #[serde(default)]
    pub kid: Option<String>,

    /// Curve name for EC and OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    /// EC x coordinate or OKP public key (base64url).
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default)]
    pub y: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    /// Algorithm the key is pinned to, if any.
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (only "sig" keys are accepted).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
}

/// Key-set document as served by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    /// List of JSON Web Keys.
    pub keys: Vec<Jwk>,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to obtain a usable key set from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("key-set request failed: {0}")]
    Transport(String),

    #[error("key-set endpoint returned status {0}")]
    Status(u16),

    #[error("key-set document could not be parsed: {0}")]
    Parse(String),

    #[error("key-set request timed out")]
    Timeout,

    #[error("key-set document contains no usable signing keys")]
    NoUsableKeys,

    #[error("key-set refresh task aborted: {0}")]
    Aborted(String),
}

/// A JWK that cannot be turned into a [`SigningKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyMaterialError {
    #[error("key has no kid")]
    MissingKid,

    #[error("key is not a signing key (use={0})")]
    NotForSigning(String),

    #[error("unsupported key type or curve: {0}")]
    UnsupportedKeyType(String),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key algorithm {0:?} does not fit key type")]
    AlgorithmMismatch(Algorithm),

    #[error("missing key parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid key material: {0}")]
    InvalidMaterial(String),
}

// =============================================================================
// Signing keys
// =============================================================================

/// Public key family, which bounds the algorithms a key may verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    EcP256,
    EcP384,
    Ed25519,
}

impl KeyType {
    /// Whether a signature made with `alg` can be checked with this key type.
    pub fn supports(self, alg: Algorithm) -> bool {
        match self {
            KeyType::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyType::EcP256 => alg == Algorithm::ES256,
            KeyType::EcP384 => alg == Algorithm::ES384,
            KeyType::Ed25519 => alg == Algorithm::EdDSA,
        }
    }
}

/// A provider public key, immutable once fetched.
///
/// Rotation never rewrites a `SigningKey`; a changed key with the same
/// `kid` becomes a new instance in a new [`KeySet`].
pub struct SigningKey {
    key_id: String,
    key_type: KeyType,
    algorithm: Option<Algorithm>,
    material: DecodingKey,
    thumbprint: String,
    fetched_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("key_type", &self.key_type)
            .field("algorithm", &self.algorithm)
            .field("thumbprint", &self.thumbprint)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Parse a JWK into a signing key.
    ///
    /// # Errors
    ///
    /// Returns `KeyMaterialError` for keys without a `kid`, non-signing keys,
    /// unsupported key types, and keys whose pinned `alg` contradicts their type.
    pub fn from_jwk(jwk: &Jwk, fetched_at: DateTime<Utc>) -> Result<Self, KeyMaterialError> {
        let key_id = jwk
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(KeyMaterialError::MissingKid)?
            .to_string();

        if let Some(key_use) = jwk.key_use.as_deref() {
            if key_use != "sig" {
                return Err(KeyMaterialError::NotForSigning(key_use.to_string()));
            }
        }

        let algorithm = jwk
            .alg
            .as_deref()
            .map(|alg| {
                Algorithm::from_str(alg)
                    .map_err(|_| KeyMaterialError::UnsupportedAlgorithm(alg.to_string()))
            })
            .transpose()?;

        let (key_type, material) = decode_material(jwk)?;

        if let Some(alg) = algorithm {
            if !key_type.supports(alg) {
                return Err(KeyMaterialError::AlgorithmMismatch(alg));
            }
        }

        Ok(Self {
            key_id,
            key_type,
            algorithm,
            material,
            thumbprint: thumbprint(jwk),
            fetched_at,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Algorithm pinned by the key-set document, if any.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Opaque verification material.
    pub fn material(&self) -> &DecodingKey {
        &self.material
    }

    /// SHA-256 over the key's public parameters (hex).
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Whether a token signed with `alg` may be verified with this key.
    pub fn accepts(&self, alg: Algorithm) -> bool {
        self.key_type.supports(alg) && self.algorithm.map_or(true, |pinned| pinned == alg)
    }
}

fn required<'a>(value: Option<&'a String>, name: &'static str) -> Result<&'a str, KeyMaterialError> {
    value
        .map(String::as_str)
        .ok_or(KeyMaterialError::MissingParameter(name))
}

fn decode_material(jwk: &Jwk) -> Result<(KeyType, DecodingKey), KeyMaterialError> {
    let invalid = |e: jsonwebtoken::errors::Error| KeyMaterialError::InvalidMaterial(e.to_string());

    match (jwk.kty.as_str(), jwk.crv.as_deref()) {
        ("RSA", _) => {
            let n = required(jwk.n.as_ref(), "n")?;
            let e = required(jwk.e.as_ref(), "e")?;
            let key = DecodingKey::from_rsa_components(n, e).map_err(invalid)?;
            Ok((KeyType::Rsa, key))
        }
        ("EC", Some(crv @ ("P-256" | "P-384"))) => {
            let x = required(jwk.x.as_ref(), "x")?;
            let y = required(jwk.y.as_ref(), "y")?;
            let key = DecodingKey::from_ec_components(x, y).map_err(invalid)?;
            let key_type = if crv == "P-256" {
                KeyType::EcP256
            } else {
                KeyType::EcP384
            };
            Ok((key_type, key))
        }
        ("OKP", Some("Ed25519")) => {
            let x = required(jwk.x.as_ref(), "x")?;
            let bytes = decode_ed25519_public_key_jwk(x)
                .map_err(|e| KeyMaterialError::InvalidMaterial(e.to_string()))?;
            if bytes.len() != 32 {
                return Err(KeyMaterialError::InvalidMaterial(format!(
                    "Ed25519 public key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
            Ok((KeyType::Ed25519, DecodingKey::from_ed_der(&bytes)))
        }
        (kty, crv) => Err(KeyMaterialError::UnsupportedKeyType(format!(
            "{kty}/{}",
            crv.unwrap_or("-")
        ))),
    }
}

fn thumbprint(jwk: &Jwk) -> String {
    let canonical = [
        Some(jwk.kty.as_str()),
        jwk.crv.as_deref(),
        jwk.x.as_deref(),
        jwk.y.as_deref(),
        jwk.n.as_deref(),
        jwk.e.as_deref(),
        jwk.alg.as_deref(),
    ]
    .map(|part| part.unwrap_or(""))
    .join("|");

    hex::encode(digest(&SHA256, canonical.as_bytes()).as_ref())
}

// =============================================================================
// Key set
// =============================================================================

/// Immutable snapshot of the provider's signing keys.
#[derive(Debug)]
pub struct KeySet {
    keys: Vec<Arc<SigningKey>>,
    retired: Vec<Arc<SigningKey>>,
    version: u64,
    last_refresh: Option<Instant>,
    next_refresh_earliest: Instant,
}

impl KeySet {
    /// The set a key source starts with: no keys, refresh allowed immediately.
    fn empty(now: Instant) -> Self {
        Self {
            keys: Vec::new(),
            retired: Vec::new(),
            version: 0,
            last_refresh: None,
            next_refresh_earliest: now,
        }
    }

    /// Build the successor of `previous` from a freshly fetched document.
    ///
    /// Keys whose `kid` and public parameters are unchanged are carried over
    /// as the same `Arc`. Keys that disappeared move to the retired list.
    /// `version` only changes when the set of keys changes.
    fn from_document(
        document: &JwksDocument,
        previous: &KeySet,
        now: Instant,
        next_refresh_earliest: Instant,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, FetchError> {
        let mut keys: Vec<Arc<SigningKey>> = Vec::with_capacity(document.keys.len());

        for jwk in &document.keys {
            let key = match SigningKey::from_jwk(jwk, fetched_at) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(
                        target: "gate.auth.keys",
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Skipping unusable key in key set"
                    );
                    continue;
                }
            };

            if keys.iter().any(|k| k.key_id == key.key_id) {
                tracing::warn!(
                    target: "gate.auth.keys",
                    kid = %key.key_id,
                    "Skipping duplicate kid in key set"
                );
                continue;
            }

            let carried = previous
                .keys
                .iter()
                .find(|k| k.key_id == key.key_id && k.thumbprint == key.thumbprint)
                .cloned();
            keys.push(carried.unwrap_or_else(|| Arc::new(key)));
        }

        if keys.is_empty() {
            return Err(FetchError::NoUsableKeys);
        }

        let identity = |set: &[Arc<SigningKey>]| -> HashSet<(String, String)> {
            set.iter()
                .map(|k| (k.key_id.clone(), k.thumbprint.clone()))
                .collect()
        };
        let current_ids = identity(&keys);
        let changed = identity(&previous.keys) != current_ids;

        let retired: Vec<Arc<SigningKey>> = previous
            .keys
            .iter()
            .chain(previous.retired.iter())
            .filter(|k| !current_ids.contains(&(k.key_id.clone(), k.thumbprint.clone())))
            .take(MAX_RETIRED_KEYS)
            .cloned()
            .collect();

        Ok(Self {
            keys,
            retired,
            version: if changed {
                previous.version + 1
            } else {
                previous.version
            },
            last_refresh: Some(now),
            next_refresh_earliest,
        })
    }

    /// Same keys, later refresh window. Used after a failed fetch.
    fn with_next_refresh(&self, next_refresh_earliest: Instant) -> Self {
        Self {
            keys: self.keys.clone(),
            retired: self.retired.clone(),
            version: self.version,
            last_refresh: self.last_refresh,
            next_refresh_earliest,
        }
    }

    /// Look up an active key by `kid`.
    pub fn get(&self, kid: &str) -> Option<&Arc<SigningKey>> {
        self.keys.iter().find(|k| k.key_id == kid)
    }

    /// Active keys in document order.
    pub fn keys(&self) -> &[Arc<SigningKey>] {
        &self.keys
    }

    /// Keys the provider no longer publishes, most recent first.
    /// They are never used for verification.
    pub fn retired(&self) -> &[Arc<SigningKey>] {
        &self.retired
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Changes only when the set of (kid, key material) changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the last successful fetch completed.
    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// Refresh attempts before this instant are no-ops.
    pub fn next_refresh_earliest(&self) -> Instant {
        self.next_refresh_earliest
    }

    /// Whether the last successful fetch is younger than `max_age`.
    pub fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        self.last_refresh
            .is_some_and(|at| now.saturating_duration_since(at) < max_age)
    }
}

// =============================================================================
// Fetchers
// =============================================================================

/// Fetches the provider's key-set document.
///
/// Implemented over HTTP by [`HttpKeyFetcher`]; tests inject fakes.
#[async_trait::async_trait]
pub trait KeyFetcherTrait: Send + Sync {
    async fn fetch(&self) -> Result<JwksDocument, FetchError>;
}

/// HTTPS key-set fetcher.
pub struct HttpKeyFetcher {
    /// URL to the key-set endpoint.
    jwks_url: String,

    /// HTTP client for fetching the key set.
    http_client: reqwest::Client,
}

impl HttpKeyFetcher {
    /// Create a fetcher for `jwks_url` with a per-request timeout.
    pub fn new(jwks_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "gate.auth.keys", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            jwks_url,
            http_client,
        }
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }
}

#[async_trait::async_trait]
impl KeyFetcherTrait for HttpKeyFetcher {
    #[instrument(skip_all, fields(url = %self.jwks_url))]
    async fn fetch(&self) -> Result<JwksDocument, FetchError> {
        tracing::debug!(target: "gate.auth.keys", "Fetching key set from provider");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        response
            .json::<JwksDocument>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }
}

// =============================================================================
// Key source
// =============================================================================

/// Tunables for [`KeySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySourceConfig {
    /// Refresh attempts closer together than this are no-ops.
    pub min_refresh_interval: Duration,

    /// A key set older than this is refreshed on the next lookup.
    pub max_key_age: Duration,

    /// Bound on a single fetch; expiry is treated as a fetch error.
    pub fetch_timeout: Duration,
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            max_key_age: DEFAULT_KEY_MAX_AGE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

struct KeySourceInner {
    fetcher: Arc<dyn KeyFetcherTrait>,
    config: KeySourceConfig,
    current: RwLock<Arc<KeySet>>,
    refresh_lock: Mutex<()>,
    /// Number of fetches that have finished, successfully or not.
    completed_refreshes: AtomicU64,
    last_error: RwLock<Option<FetchError>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl KeySourceInner {
    fn snapshot(&self) -> Arc<KeySet> {
        Arc::clone(&read(&self.current))
    }

    async fn refresh_serialized(&self, observed: u64) -> Result<Arc<KeySet>, FetchError> {
        let _guard = self.refresh_lock.lock().await;

        // A fetch finished while we were waiting; share its outcome
        if self.completed_refreshes.load(Ordering::Acquire) != observed {
            tracing::debug!(target: "gate.auth.keys", "Joined in-flight key-set refresh");
            return match read(&self.last_error).clone() {
                Some(e) => Err(e),
                None => Ok(self.snapshot()),
            };
        }

        let current = self.snapshot();
        let now = Instant::now();
        if now < current.next_refresh_earliest {
            tracing::debug!(target: "gate.auth.keys", "Key-set refresh rate limited");
            metrics::record_key_refresh("rate_limited");
            return Ok(current);
        }

        let next_refresh_earliest = instant_after(now, self.config.min_refresh_interval)
            .max(instant_after(current.next_refresh_earliest, Duration::from_nanos(1)));

        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch())
            .await
            .unwrap_or(Err(FetchError::Timeout));

        let outcome = fetched.and_then(|document| {
            KeySet::from_document(&document, &current, now, next_refresh_earliest, Utc::now())
        });

        let result = match outcome {
            Ok(key_set) => {
                let key_set = Arc::new(key_set);
                let changed = key_set.version != current.version;
                tracing::info!(
                    target: "gate.auth.keys",
                    key_count = key_set.len(),
                    retired_count = key_set.retired.len(),
                    version = key_set.version,
                    changed = changed,
                    "Key set refreshed"
                );
                metrics::record_key_refresh(if changed { "changed" } else { "unchanged" });
                metrics::set_active_keys(key_set.len());

                *write(&self.current) = Arc::clone(&key_set);
                *write(&self.last_error) = None;
                Ok(key_set)
            }
            Err(e) => {
                tracing::warn!(
                    target: "gate.auth.keys",
                    error = %e,
                    retained_keys = current.len(),
                    "Key-set refresh failed, keeping previous keys"
                );
                metrics::record_key_refresh("error");

                *write(&self.current) = Arc::new(current.with_next_refresh(next_refresh_earliest));
                *write(&self.last_error) = Some(e.clone());
                Err(e)
            }
        };

        self.completed_refreshes.fetch_add(1, Ordering::Release);
        result
    }
}

/// Owner of the provider's signing keys.
///
/// Cheap to clone; all clones share one key set.
#[derive(Clone)]
pub struct KeySource {
    inner: Arc<KeySourceInner>,
}

impl KeySource {
    /// Create a key source over any fetcher. Starts with an empty key set.
    pub fn new(fetcher: Arc<dyn KeyFetcherTrait>, config: KeySourceConfig) -> Self {
        Self {
            inner: Arc::new(KeySourceInner {
                fetcher,
                current: RwLock::new(Arc::new(KeySet::empty(Instant::now()))),
                config,
                refresh_lock: Mutex::new(()),
                completed_refreshes: AtomicU64::new(0),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// Create a key source that fetches `jwks_url` over HTTP.
    pub fn from_url(jwks_url: String, config: KeySourceConfig) -> Self {
        let fetcher = Arc::new(HttpKeyFetcher::new(jwks_url, config.fetch_timeout));
        Self::new(fetcher, config)
    }

    pub fn config(&self) -> &KeySourceConfig {
        &self.inner.config
    }

    /// Current key set.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.inner.snapshot()
    }

    /// Version of the current key set.
    pub fn version(&self) -> u64 {
        read(&self.inner.current).version
    }

    /// Get a signing key by `kid`.
    ///
    /// Returns the cached key when the key set is fresh and contains it.
    /// Otherwise refreshes once (subject to the rate limit) and looks again.
    /// On a failed refresh the previously cached key, if any, is returned.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Option<Arc<SigningKey>> {
        let snapshot = self.snapshot();
        if snapshot.is_fresh(Instant::now(), self.inner.config.max_key_age) {
            if let Some(key) = snapshot.get(kid) {
                tracing::trace!(target: "gate.auth.keys", "Key cache hit");
                return Some(Arc::clone(key));
            }
        }

        match self.refresh().await {
            Ok(key_set) => {
                let key = key_set.get(kid).cloned();
                if key.is_none() {
                    tracing::debug!(target: "gate.auth.keys", "Key not found after refresh");
                }
                key
            }
            Err(e) => {
                tracing::debug!(
                    target: "gate.auth.keys",
                    error = %e,
                    "Refresh failed, falling back to cached keys"
                );
                self.snapshot().get(kid).cloned()
            }
        }
    }

    /// Fetch the provider's current key set and swap it in.
    ///
    /// Returns the current snapshot unchanged when called before
    /// `next_refresh_earliest`. Concurrent callers share one fetch.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` when the fetch fails or times out; the previous
    /// key set stays in place.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, FetchError> {
        let snapshot = self.snapshot();
        if Instant::now() < snapshot.next_refresh_earliest
            && self.inner.refresh_lock.try_lock().is_ok()
        {
            metrics::record_key_refresh("rate_limited");
            return Ok(snapshot);
        }

        let observed = self.inner.completed_refreshes.load(Ordering::Acquire);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.refresh_serialized(observed).await })
            .await
            .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// RFC 8037 example Ed25519 public key.
    const ED25519_X: &str = "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo";
    const OTHER_ED25519_X: &str = "dGVzdC1wdWJsaWMta2V5LWRhdGEtMzItYnl0ZXMhISE";

    fn okp(kid: &str, x: &str) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            kid: Some(kid.to_string()),
            crv: Some("Ed25519".to_string()),
            x: Some(x.to_string()),
            y: None,
            n: None,
            e: None,
            alg: Some("EdDSA".to_string()),
            key_use: Some("sig".to_string()),
        }
    }

    fn doc(keys: Vec<Jwk>) -> JwksDocument {
        JwksDocument { keys }
    }

    /// Fetcher that replays scripted responses and counts calls.
    struct ScriptedFetcher {
        responses: std::sync::Mutex<VecDeque<Result<JwksDocument, FetchError>>>,
        fallback: Result<JwksDocument, FetchError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn always(result: Result<JwksDocument, FetchError>) -> Arc<Self> {
            Self::scripted(Vec::new(), result, Duration::ZERO)
        }

        fn scripted(
            responses: Vec<Result<JwksDocument, FetchError>>,
            fallback: Result<JwksDocument, FetchError>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
                fallback,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl KeyFetcherTrait for ScriptedFetcher {
        async fn fetch(&self) -> Result<JwksDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn config(min_refresh_interval: Duration) -> KeySourceConfig {
        KeySourceConfig {
            min_refresh_interval,
            max_key_age: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    // =========================================================================
    // Key set document tests
    // =========================================================================

    #[test]
    fn test_jwk_deserialization() {
        let json = r#"{
            "kty": "OKP",
            "kid": "test-key-01",
            "crv": "Ed25519",
            "x": "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo",
            "alg": "EdDSA",
            "use": "sig"
        }"#;

        let jwk: Jwk = serde_json::from_str(json).unwrap();

        assert_eq!(jwk.kty, "OKP");
        assert_eq!(jwk.kid.as_deref(), Some("test-key-01"));
        assert_eq!(jwk.crv.as_deref(), Some("Ed25519"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
    }

    #[test]
    fn test_jwks_document_deserialization_rsa() {
        let json = r#"{
            "keys": [
                {"kty": "RSA", "kid": "ins_1", "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw", "e": "AQAB", "alg": "RS256", "use": "sig"},
                {"kty": "OKP", "kid": "ins_2", "crv": "Ed25519", "x": "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo"}
            ]
        }"#;

        let jwks: JwksDocument = serde_json::from_str(json).unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys.first().unwrap().kty, "RSA");
        assert_eq!(jwks.keys.first().unwrap().e.as_deref(), Some("AQAB"));
    }

    // =========================================================================
    // SigningKey tests
    // =========================================================================

    #[test]
    fn test_signing_key_from_okp_jwk() {
        let key = SigningKey::from_jwk(&okp("k1", ED25519_X), Utc::now()).unwrap();

        assert_eq!(key.key_id(), "k1");
        assert_eq!(key.key_type(), KeyType::Ed25519);
        assert_eq!(key.algorithm(), Some(Algorithm::EdDSA));
        assert!(key.accepts(Algorithm::EdDSA));
        assert!(!key.accepts(Algorithm::RS256));
        assert_eq!(key.thumbprint().len(), 64);
    }

    #[test]
    fn test_signing_key_rejects_missing_kid() {
        let mut jwk = okp("k1", ED25519_X);
        jwk.kid = None;
        assert_eq!(
            SigningKey::from_jwk(&jwk, Utc::now()).unwrap_err(),
            KeyMaterialError::MissingKid
        );
    }

    #[test]
    fn test_signing_key_rejects_encryption_keys() {
        let mut jwk = okp("k1", ED25519_X);
        jwk.key_use = Some("enc".to_string());
        assert_eq!(
            SigningKey::from_jwk(&jwk, Utc::now()).unwrap_err(),
            KeyMaterialError::NotForSigning("enc".to_string())
        );
    }

    #[test]
    fn test_signing_key_rejects_alg_contradicting_key_type() {
        let mut jwk = okp("k1", ED25519_X);
        jwk.alg = Some("RS256".to_string());
        assert_eq!(
            SigningKey::from_jwk(&jwk, Utc::now()).unwrap_err(),
            KeyMaterialError::AlgorithmMismatch(Algorithm::RS256)
        );
    }

    #[test]
    fn test_signing_key_rejects_symmetric_and_unknown_types() {
        let mut jwk = okp("k1", ED25519_X);
        jwk.kty = "oct".to_string();
        assert!(matches!(
            SigningKey::from_jwk(&jwk, Utc::now()),
            Err(KeyMaterialError::UnsupportedKeyType(_))
        ));

        let mut jwk = okp("k1", ED25519_X);
        jwk.crv = Some("X25519".to_string());
        assert!(matches!(
            SigningKey::from_jwk(&jwk, Utc::now()),
            Err(KeyMaterialError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_signing_key_rejects_short_ed25519_key() {
        let jwk = okp("k1", "dGVzdA");
        assert!(matches!(
            SigningKey::from_jwk(&jwk, Utc::now()),
            Err(KeyMaterialError::InvalidMaterial(_))
        ));
    }

    #[test]
    fn test_signing_key_without_pinned_alg_accepts_family() {
        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: Some("rsa-1".to_string()),
            crv: None,
            x: None,
            y: None,
            n: Some("sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw".to_string()),
            e: Some("AQAB".to_string()),
            alg: None,
            key_use: None,
        };
        let key = SigningKey::from_jwk(&jwk, Utc::now()).unwrap();

        assert!(key.accepts(Algorithm::RS256));
        assert!(key.accepts(Algorithm::PS512));
        assert!(!key.accepts(Algorithm::ES256));
        assert!(!key.accepts(Algorithm::HS256));
    }

    // =========================================================================
    // Refresh tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_refresh_populates_key_set() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(30)));

        assert!(source.snapshot().is_empty());
        assert_eq!(source.version(), 0);

        let key_set = source.refresh().await.unwrap();

        assert_eq!(key_set.len(), 1);
        assert!(key_set.get("k1").is_some());
        assert_eq!(key_set.version(), 1);
        assert!(key_set.last_refresh().is_some());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_rate_limited() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(30)));

        source.refresh().await.unwrap();
        let second = source.refresh().await.unwrap();

        assert_eq!(fetcher.calls(), 1, "second refresh inside the window must not fetch");
        assert_eq!(second.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        source.refresh().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_refresh_earliest_strictly_increases() {
        let fetcher = ScriptedFetcher::scripted(
            vec![Err(FetchError::Status(500))],
            Ok(doc(vec![okp("k1", ED25519_X)])),
            Duration::ZERO,
        );
        let source = KeySource::new(fetcher, config(Duration::ZERO));

        let mut previous = source.snapshot().next_refresh_earliest();
        for _ in 0..3 {
            let _ = source.refresh().await;
            let current = source.snapshot().next_refresh_earliest();
            assert!(current > previous);
            previous = current;
            tokio::time::advance(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_keys() {
        let fetcher = ScriptedFetcher::scripted(
            vec![Ok(doc(vec![okp("k1", ED25519_X)]))],
            Err(FetchError::Transport("connection refused".to_string())),
            Duration::ZERO,
        );
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(1)));

        source.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let err = source.refresh().await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));

        let snapshot = source.snapshot();
        assert!(snapshot.get("k1").is_some(), "cached key must survive a failed fetch");
        assert_eq!(snapshot.version(), 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_document_is_a_fetch_error() {
        let fetcher = ScriptedFetcher::always(Ok(doc(Vec::new())));
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        assert_eq!(source.refresh().await.unwrap_err(), FetchError::NoUsableKeys);
        assert_eq!(source.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_is_a_fetch_error() {
        let fetcher = ScriptedFetcher::scripted(
            Vec::new(),
            Ok(doc(vec![okp("k1", ED25519_X)])),
            Duration::from_secs(10),
        );
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        assert_eq!(source.refresh().await.unwrap_err(), FetchError::Timeout);
        assert!(source.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let fetcher = ScriptedFetcher::scripted(
            Vec::new(),
            Ok(doc(vec![okp("k1", ED25519_X)])),
            Duration::from_millis(100),
        );
        let source = KeySource::new(fetcher.clone(), config(Duration::ZERO));

        let results =
            futures::future::join_all((0..10).map(|_| source.refresh())).await;

        assert_eq!(fetcher.calls(), 1);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|set| set.len() == 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_caller_does_not_cancel_refresh() {
        let fetcher = ScriptedFetcher::scripted(
            Vec::new(),
            Ok(doc(vec![okp("k1", ED25519_X)])),
            Duration::from_millis(500),
        );
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(30)));

        let caller = {
            let source = source.clone();
            tokio::spawn(async move { source.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fetcher.calls(), 1, "fetch should be in flight");
        assert!(source.snapshot().is_empty());

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let key_set = source.snapshot();
        assert_eq!(key_set.len(), 1);
        assert!(key_set.get("k1").is_some());
        assert_eq!(source.version(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_refresh_interval_saturates() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(
            fetcher.clone(),
            KeySourceConfig {
                min_refresh_interval: Duration::MAX,
                max_key_age: Duration::MAX,
                fetch_timeout: Duration::from_secs(1),
            },
        );

        let key_set = source.refresh().await.unwrap();
        assert_eq!(key_set.len(), 1);
        assert!(key_set.next_refresh_earliest() > Instant::now());

        // Rate limited rather than overflowing
        let again = source.refresh().await.unwrap();
        assert_eq!(again.version(), 1);
        assert_eq!(fetcher.calls(), 1);
        assert!(source.get_key("k1").await.is_some());
    }

    #[test]
    fn test_instant_after_saturates_on_overflow() {
        let start = Instant::now();
        assert_eq!(
            instant_after(start, Duration::from_secs(5)),
            start + Duration::from_secs(5)
        );
        assert!(instant_after(start, Duration::MAX) > start + Duration::from_secs(86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_document_keeps_version_and_key_instances() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        let first = source.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = source.refresh().await.unwrap();

        assert_eq!(first.version(), second.version());
        assert!(Arc::ptr_eq(
            first.get("k1").unwrap(),
            second.get("k1").unwrap()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_bumps_version_and_retires_old_key() {
        let fetcher = ScriptedFetcher::scripted(
            vec![Ok(doc(vec![okp("k1", ED25519_X)]))],
            Ok(doc(vec![okp("k2", OTHER_ED25519_X)])),
            Duration::ZERO,
        );
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        let before = source.refresh().await.unwrap();
        let old_key = Arc::clone(before.get("k1").unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        let after = source.refresh().await.unwrap();

        assert_eq!(after.version(), before.version() + 1);
        assert!(after.get("k1").is_none(), "retired keys are not served");
        assert!(after.get("k2").is_some());
        assert_eq!(after.retired().len(), 1);
        assert!(Arc::ptr_eq(after.retired().first().unwrap(), &old_key));
        // The old snapshot is untouched
        assert!(before.get("k1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_kid_new_material_is_a_new_key() {
        let fetcher = ScriptedFetcher::scripted(
            vec![Ok(doc(vec![okp("k1", ED25519_X)]))],
            Ok(doc(vec![okp("k1", OTHER_ED25519_X)])),
            Duration::ZERO,
        );
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        let before = source.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let after = source.refresh().await.unwrap();

        let old = before.get("k1").unwrap();
        let new = after.get("k1").unwrap();
        assert!(!Arc::ptr_eq(old, new));
        assert_ne!(old.thumbprint(), new.thumbprint());
        assert_eq!(after.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_keys_are_skipped() {
        let mut enc = okp("enc-key", ED25519_X);
        enc.key_use = Some("enc".to_string());
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![
            enc,
            okp("k1", ED25519_X),
            okp("k1", OTHER_ED25519_X),
        ])));
        let source = KeySource::new(fetcher, config(Duration::from_secs(1)));

        let key_set = source.refresh().await.unwrap();
        assert_eq!(key_set.len(), 1);
        assert!(key_set.get("enc-key").is_none());
    }

    // =========================================================================
    // get_key tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_get_key_loads_lazily_and_hits_cache() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(30)));

        assert!(source.get_key("k1").await.is_some());
        assert!(source.get_key("k1").await.is_some());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_key_unknown_kid_refreshes_at_most_once_per_window() {
        let fetcher = ScriptedFetcher::always(Ok(doc(vec![okp("k1", ED25519_X)])));
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(30)));

        source.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(source.get_key("unknown").await.is_none());
        assert_eq!(fetcher.calls(), 2);

        assert!(source.get_key("unknown").await.is_none());
        assert!(source.get_key("another-unknown").await.is_none());
        assert_eq!(fetcher.calls(), 2, "probing kids inside the window must not fetch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_key_stale_set_falls_back_when_fetch_fails() {
        let fetcher = ScriptedFetcher::scripted(
            vec![Ok(doc(vec![okp("k1", ED25519_X)]))],
            Err(FetchError::Status(503)),
            Duration::ZERO,
        );
        let source = KeySource::new(fetcher.clone(), config(Duration::from_secs(1)));

        source.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(source.get_key("k1").await.is_some(), "fail-open for cached keys");
        assert_eq!(fetcher.calls(), 2);
        assert!(source.get_key("k2").await.is_none(), "fail-closed for unknown keys");
    }
}
