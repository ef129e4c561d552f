//! Session Gate configuration.
//!
//! Configuration is loaded from environment variables. Every optional
//! setting has a public default constant; nothing in here is secret, so
//! Debug output is safe to log.

use crate::auth::key_source::{
    KeySourceConfig, DEFAULT_FETCH_TIMEOUT, DEFAULT_KEY_MAX_AGE, DEFAULT_MIN_REFRESH_INTERVAL,
};
use crate::auth::session_cache::{
    SessionCacheConfig, DEFAULT_MAX_CACHE_ENTRIES, DEFAULT_MAX_CACHE_TTL,
    DEFAULT_NEGATIVE_CACHE_TTL,
};
use crate::auth::verifier::{VerifierConfig, DEFAULT_ALLOWED_ALGORITHMS};
use crate::auth::CacheInvalidationPolicy;
use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use jsonwebtoken::Algorithm;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default interval between session cache sweeps.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for the key refresh interval and key max age (1 day).
pub const MAX_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(86_400);

/// Upper bound for the positive cache TTL (1 day).
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Upper bound for a single key-set fetch.
pub const MAX_JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for the cache sweep interval (1 hour).
pub const MAX_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

/// Session Gate configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Required `iss` claim.
    pub issuer: String,

    /// Audience every protected route expects in `aud`.
    pub audience: String,

    /// Provider key-set endpoint.
    pub jwks_url: String,

    /// Algorithms a token may be signed with.
    pub allowed_algorithms: Vec<Algorithm>,

    /// Tolerance for `exp`, `nbf` and `iat` checks.
    pub clock_skew: Duration,

    /// Upper bound on how long any verification result is cached.
    pub max_cache_ttl: Duration,

    /// How long Invalid results are cached.
    pub negative_cache_ttl: Duration,

    /// Upper bound on cached results (0 disables the cache).
    pub max_cache_entries: usize,

    /// Refresh attempts closer together than this are no-ops.
    pub min_key_refresh_interval: Duration,

    /// Key-set age that triggers a refresh; also the scheduled refresh period.
    pub key_max_age: Duration,

    /// Bound on a single key-set fetch.
    pub jwks_fetch_timeout: Duration,

    /// Interval between cache sweeps.
    pub cache_sweep_interval: Duration,

    /// Whether a changed key set drops cached results.
    pub cache_invalidation: CacheInvalidationPolicy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid key-set URL configuration: {0}")]
    InvalidJwksUrl(String),

    #[error("Invalid algorithm configuration: {0}")]
    InvalidAlgorithms(String),

    #[error("Invalid clock skew configuration: {0}")]
    InvalidClockSkew(String),

    #[error("Invalid cache configuration: {0}")]
    InvalidCache(String),

    #[error("Invalid key refresh configuration: {0}")]
    InvalidKeyRefresh(String),

    #[error("Invalid duration for {name}: {reason}")]
    InvalidDuration { name: String, reason: String },

    #[error("Invalid boolean for {0}")]
    InvalidFlag(String),
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_u64(vars: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    vars.get(name)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|e| ConfigError::InvalidDuration {
                name: name.to_string(),
                reason: format!("must be a non-negative integer, got '{value}': {e}"),
            })
        })
        .transpose()
}

/// A duration in `(0, max]`, in units produced by `unit`.
fn positive_duration(
    vars: &HashMap<String, String>,
    name: &str,
    unit: fn(u64) -> Duration,
    default: Duration,
    max: Duration,
) -> Result<Duration, ConfigError> {
    match parse_u64(vars, name)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidDuration {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        }),
        Some(value) if unit(value) > max => Err(ConfigError::InvalidDuration {
            name: name.to_string(),
            reason: format!("must not exceed {max:?}, got {value}"),
        }),
        Some(value) => Ok(unit(value)),
    }
}

fn flag(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("" | "false" | "0") => Ok(false),
        Some("true" | "1") => Ok(true),
        Some(_) => Err(ConfigError::InvalidFlag(name.to_string())),
    }
}

fn parse_algorithms(value: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let mut algorithms = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let alg = Algorithm::from_str(name).map_err(|_| {
            ConfigError::InvalidAlgorithms(format!("unknown algorithm '{name}'"))
        })?;
        if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(ConfigError::InvalidAlgorithms(format!(
                "symmetric algorithm '{name}' is not allowed"
            )));
        }
        if !algorithms.contains(&alg) {
            algorithms.push(alg);
        }
    }

    if algorithms.is_empty() {
        return Err(ConfigError::InvalidAlgorithms(
            "GATE_ALLOWED_ALGORITHMS must name at least one algorithm".to_string(),
        ));
    }
    Ok(algorithms)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let issuer = required(vars, "GATE_ISSUER")?;
        let audience = required(vars, "GATE_AUDIENCE")?;
        let jwks_url = required(vars, "GATE_JWKS_URL")?;

        let allow_insecure_jwks = flag(vars, "GATE_ALLOW_INSECURE_JWKS")?;
        if !jwks_url.starts_with("https://")
            && !(allow_insecure_jwks && jwks_url.starts_with("http://"))
        {
            return Err(ConfigError::InvalidJwksUrl(format!(
                "GATE_JWKS_URL must be an https:// URL, got '{jwks_url}'"
            )));
        }

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let allowed_algorithms = match vars.get("GATE_ALLOWED_ALGORITHMS") {
            Some(value) => parse_algorithms(value)?,
            None => DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
        };

        // Parse clock skew tolerance with validation
        let clock_skew = match parse_u64(vars, "GATE_CLOCK_SKEW_SECONDS")
            .map_err(|e| ConfigError::InvalidClockSkew(e.to_string()))?
        {
            None => DEFAULT_CLOCK_SKEW,
            Some(value) if value > MAX_CLOCK_SKEW.as_secs() => {
                return Err(ConfigError::InvalidClockSkew(format!(
                    "GATE_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }
            Some(value) => Duration::from_secs(value),
        };

        // Parse cache bounds with validation
        let max_cache_ttl = positive_duration(
            vars,
            "GATE_MAX_CACHE_TTL_SECONDS",
            Duration::from_secs,
            DEFAULT_MAX_CACHE_TTL,
            MAX_CACHE_TTL,
        )?;
        let negative_cache_ttl = parse_u64(vars, "GATE_NEGATIVE_CACHE_TTL_SECONDS")?
            .map_or(DEFAULT_NEGATIVE_CACHE_TTL, Duration::from_secs);
        if negative_cache_ttl > max_cache_ttl {
            return Err(ConfigError::InvalidCache(format!(
                "GATE_NEGATIVE_CACHE_TTL_SECONDS ({}) must not exceed GATE_MAX_CACHE_TTL_SECONDS ({})",
                negative_cache_ttl.as_secs(),
                max_cache_ttl.as_secs()
            )));
        }

        let max_cache_entries = match vars.get("GATE_MAX_CACHE_ENTRIES") {
            Some(value) => value.trim().parse::<usize>().map_err(|e| {
                ConfigError::InvalidCache(format!(
                    "GATE_MAX_CACHE_ENTRIES must be a non-negative integer, got '{value}': {e}"
                ))
            })?,
            None => DEFAULT_MAX_CACHE_ENTRIES,
        };

        let cache_invalidation = match vars.get("GATE_CACHE_INVALIDATION") {
            Some(value) => CacheInvalidationPolicy::parse(value.trim()).ok_or_else(|| {
                ConfigError::InvalidCache(format!(
                    "GATE_CACHE_INVALIDATION must be 'on_key_set_change' or 'never', got '{value}'"
                ))
            })?,
            None => CacheInvalidationPolicy::default(),
        };

        // Parse key refresh settings with validation
        let min_key_refresh_interval = positive_duration(
            vars,
            "GATE_MIN_KEY_REFRESH_SECONDS",
            Duration::from_secs,
            DEFAULT_MIN_REFRESH_INTERVAL,
            MAX_KEY_REFRESH_INTERVAL,
        )?;
        let key_max_age = positive_duration(
            vars,
            "GATE_KEY_MAX_AGE_SECONDS",
            Duration::from_secs,
            DEFAULT_KEY_MAX_AGE,
            MAX_KEY_REFRESH_INTERVAL,
        )?;
        if key_max_age < min_key_refresh_interval {
            return Err(ConfigError::InvalidKeyRefresh(format!(
                "GATE_KEY_MAX_AGE_SECONDS ({}) must be at least GATE_MIN_KEY_REFRESH_SECONDS ({})",
                key_max_age.as_secs(),
                min_key_refresh_interval.as_secs()
            )));
        }
        let jwks_fetch_timeout = positive_duration(
            vars,
            "GATE_JWKS_FETCH_TIMEOUT_MS",
            Duration::from_millis,
            DEFAULT_FETCH_TIMEOUT,
            MAX_JWKS_FETCH_TIMEOUT,
        )?;

        let cache_sweep_interval = positive_duration(
            vars,
            "GATE_CACHE_SWEEP_SECONDS",
            Duration::from_secs,
            DEFAULT_CACHE_SWEEP_INTERVAL,
            MAX_CACHE_SWEEP_INTERVAL,
        )?;

        Ok(Config {
            bind_address,
            issuer,
            audience,
            jwks_url,
            allowed_algorithms,
            clock_skew,
            max_cache_ttl,
            negative_cache_ttl,
            max_cache_entries,
            min_key_refresh_interval,
            key_max_age,
            jwks_fetch_timeout,
            cache_sweep_interval,
            cache_invalidation,
        })
    }

    pub fn key_source_config(&self) -> KeySourceConfig {
        KeySourceConfig {
            min_refresh_interval: self.min_key_refresh_interval,
            max_key_age: self.key_max_age,
            fetch_timeout: self.jwks_fetch_timeout,
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            issuer: self.issuer.clone(),
            allowed_algorithms: self.allowed_algorithms.clone(),
            clock_skew: self.clock_skew,
        }
    }

    pub fn session_cache_config(&self) -> SessionCacheConfig {
        SessionCacheConfig {
            max_ttl: self.max_cache_ttl,
            negative_ttl: self.negative_cache_ttl,
            max_entries: self.max_cache_entries,
        }
    }
}
