//! Memoized verification results keyed by token fingerprint.
//!
//! Raw tokens are never stored; entries are keyed by the SHA-256 of the
//! token. An entry never outlives the token it describes, and negative
//! results get their own short TTL.
//!
//! Expired entries are dropped lazily on lookup and by a periodic sweep.
//! When the table is full the oldest entry is evicted first.

use crate::auth::verifier::VerificationResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::digest::{digest, SHA256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default upper bound on how long any result is cached.
pub const DEFAULT_MAX_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default TTL for negative (Invalid) results.
pub const DEFAULT_NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default upper bound on cached entries.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

/// SHA-256 of a raw token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(raw_token: &str) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest(&SHA256, raw_token.as_bytes()).as_ref());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.0.get(..4).map(hex::encode).unwrap_or_default();
        write!(f, "Fingerprint({prefix}..)")
    }
}

/// A cached verification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: VerificationResult,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    seq: u64,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(VerificationResult),
    Miss,
}

/// Cache bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCacheConfig {
    /// Upper bound on any entry's lifetime.
    pub max_ttl: Duration,

    /// Lifetime of Invalid results, capped at `max_ttl`.
    pub negative_ttl: Duration,

    /// Maximum number of entries; 0 disables caching.
    pub max_entries: usize,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            max_ttl: DEFAULT_MAX_CACHE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_CACHE_TTL,
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order. May hold stale sequence numbers for replaced or
    /// removed entries; those are skipped on eviction.
    order: VecDeque<(u64, Fingerprint)>,
    next_seq: u64,
}

impl CacheState {
    fn remove_if_seq(&mut self, fingerprint: &Fingerprint, seq: u64) -> bool {
        if self.entries.get(fingerprint).is_some_and(|e| e.seq == seq) {
            self.entries.remove(fingerprint);
            true
        } else {
            false
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((seq, fingerprint)) = self.order.pop_front() {
            if self.remove_if_seq(&fingerprint, seq) {
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, fp)| entries.get(fp).is_some_and(|e| e.seq == *seq));
    }
}

/// Thread-safe verification cache.
pub struct SessionCache {
    config: SessionCacheConfig,
    state: Mutex<CacheState>,
}

fn after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl SessionCache {
    pub fn new(config: SessionCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &SessionCacheConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a cached result for `raw_token`.
    pub fn lookup(&self, raw_token: &str) -> CacheLookup {
        self.lookup_at(raw_token, Utc::now())
    }

    /// Look up a cached result as of `now`. Expired entries are removed.
    pub fn lookup_at(&self, raw_token: &str, now: DateTime<Utc>) -> CacheLookup {
        let fingerprint = Fingerprint::of(raw_token);
        let mut state = self.state();

        match state.entries.get(&fingerprint) {
            Some(entry) if entry.expires_at > now => CacheLookup::Hit(entry.result.clone()),
            Some(_) => {
                state.entries.remove(&fingerprint);
                CacheLookup::Miss
            }
            None => CacheLookup::Miss,
        }
    }

    /// When an entry for `result` stored at `now` would expire.
    fn expiry_for(&self, result: &VerificationResult, now: DateTime<Utc>) -> DateTime<Utc> {
        let ceiling = after(now, self.config.max_ttl);
        match result {
            VerificationResult::Valid(claims) => DateTime::from_timestamp(claims.expires_at, 0)
                .map_or(now, |token_exp| ceiling.min(token_exp)),
            VerificationResult::Invalid(_) => ceiling.min(after(now, self.config.negative_ttl)),
        }
    }

    /// Cache `result` for `raw_token`.
    ///
    /// Nothing is stored when the entry would already be expired, e.g. a
    /// token accepted within the clock-skew tolerance after its `exp`.
    pub fn store(&self, raw_token: &str, result: VerificationResult, now: DateTime<Utc>) {
        self.store_if(raw_token, result, now, || true);
    }

    /// Cache `result` only if `still_current` holds.
    ///
    /// `still_current` runs under the cache lock, so an `invalidate_all`
    /// issued after it returns `false` cannot be undone by this insert, and
    /// one issued after it returns `true` removes the new entry. Returns
    /// whether the entry was stored.
    pub fn store_if(
        &self,
        raw_token: &str,
        result: VerificationResult,
        now: DateTime<Utc>,
        still_current: impl FnOnce() -> bool,
    ) -> bool {
        if self.config.max_entries == 0 {
            return false;
        }

        let expires_at = self.expiry_for(&result, now);
        if expires_at <= now {
            return false;
        }

        let fingerprint = Fingerprint::of(raw_token);
        let mut state = self.state();
        if !still_current() {
            return false;
        }

        let mut evicted = 0usize;
        while !state.entries.contains_key(&fingerprint)
            && state.entries.len() >= self.config.max_entries
        {
            if !state.evict_oldest() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(
                target: "gate.auth.cache",
                evicted = evicted,
                max_entries = self.config.max_entries,
                "Session cache full, evicted oldest entries"
            );
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.push_back((seq, fingerprint));
        state.entries.insert(
            fingerprint,
            CacheEntry {
                fingerprint,
                result,
                cached_at: now,
                expires_at,
                seq,
            },
        );

        if state.order.len() > self.config.max_entries.saturating_mul(2) {
            state.compact_order();
        }
        true
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        let mut state = self.state();
        let dropped = state.entries.len();
        state.entries.clear();
        state.order.clear();
        tracing::info!(
            target: "gate.auth.cache",
            dropped = dropped,
            "Session cache invalidated"
        );
    }

    /// Remove entries expired as of `now`; returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - state.entries.len();
        if removed > 0 {
            state.compact_order();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
