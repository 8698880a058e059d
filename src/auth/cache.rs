//! Key set cache with TTL, stale grace window and coalesced refresh.
//!
//! # Timing
//!
//! ```text
//!  fetched_at          fetched_at + ttl          fetched_at + ttl + max_stale
//!      |---- fresh ----------|------- stale (servable) ------|---- expired ----
//! ```
//!
//! - **fresh**: served without touching the source.
//! - **stale**: the first caller refreshes; callers arriving while that fetch
//!   is in flight get the stale set immediately. A failed refresh still serves
//!   the stale set.
//! - **expired** (or empty): never served. Callers wait, bounded by
//!   `cold_start_wait`, for an in-flight fetch; otherwise `KeyUnavailable`.
//!
//! At most one fetch per cache instance is outstanding at any time. The
//! refresh lock is a `tokio::sync::Mutex` held across the fetch; the current
//! entry sits behind a `parking_lot::RwLock` that is never held across an
//! `.await`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::keys::{KeyError, KeyFetcher, KeySet, KeySource};
use crate::config::{AuthConfig, KeyCacheConfig};

/// One cached key set and its timing.
struct CacheEntry {
    keys: Arc<KeySet>,
    fetched_at: DateTime<Utc>,
    generation: u64,
}

impl CacheEntry {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        // A clock that moved backwards counts as age zero.
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Cache state as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CacheStatus {
    /// Nothing has been fetched yet.
    Empty,
    /// Within TTL.
    Fresh {
        /// Seconds since fetch.
        age_secs: u64,
        /// Keys in the set.
        keys: usize,
    },
    /// Past TTL but still servable.
    Stale {
        /// Seconds since fetch.
        age_secs: u64,
        /// Keys in the set.
        keys: usize,
    },
    /// Past TTL and grace window; will not be served.
    Expired {
        /// Seconds since fetch.
        age_secs: u64,
    },
}

/// Shared, concurrently readable key set cache.
pub struct KeyCache {
    fetcher: Arc<dyn KeyFetcher>,
    ttl: Duration,
    max_stale: Duration,
    min_refresh_interval: Duration,
    cold_start_wait: Duration,
    entry: RwLock<Option<CacheEntry>>,
    refresh_lock: Mutex<()>,
    refresh_attempts: AtomicU64,
}

impl KeyCache {
    /// Create an empty cache in front of `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeyFetcher>, config: &KeyCacheConfig) -> Self {
        Self {
            fetcher,
            ttl: config.ttl,
            max_stale: config.max_stale,
            min_refresh_interval: config.min_refresh_interval,
            cold_start_wait: config.cold_start_wait,
            entry: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_attempts: AtomicU64::new(0),
        }
    }

    /// Create a cache over the key source selected by the auth mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote key source cannot be built.
    pub fn from_config(config: &AuthConfig) -> crate::Result<Self> {
        let source = KeySource::from_config(config)?;
        Ok(Self::new(Arc::new(source), &config.cache))
    }

    /// Return a servable key set, refreshing if the cached one is past TTL.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unavailable`] when no key set younger than
    /// `ttl + max_stale` exists and a refresh did not produce one.
    pub async fn get(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, KeyError> {
        if let Some(keys) = self.fresh(now) {
            return Ok(keys);
        }

        match self.refresh_lock.try_lock() {
            Ok(_guard) => {
                // Another caller may have refreshed between the check and the lock.
                if let Some(keys) = self.fresh(now) {
                    return Ok(keys);
                }
                self.refresh_locked(now).await
            }
            Err(_) => {
                if let Some(stale) = self.servable(now) {
                    debug!("Key refresh in flight, serving cached key set");
                    return Ok(stale);
                }
                self.wait_for_in_flight(now).await
            }
        }
    }

    /// Refresh ahead of TTL because a token named a key id the cached set
    /// lacks (key rotation). Rate limited by `min_refresh_interval` and
    /// coalesced with any other refresh.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unavailable`] when nothing servable remains.
    pub async fn refresh_for_unknown_kid(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<KeySet>, KeyError> {
        let seen_generation = {
            let entry = self.entry.read();
            match entry.as_ref() {
                Some(e) if e.age(now) < self.min_refresh_interval => {
                    let age = e.age(now);
                    if age >= self.ttl + self.max_stale {
                        return Err(KeyError::Unavailable);
                    }
                    debug!(kid = %kid, "Unknown kid, key set too recent to refresh");
                    return Ok(Arc::clone(&e.keys));
                }
                Some(e) => Some(e.generation),
                None => None,
            }
        };

        match self.refresh_lock.try_lock() {
            Ok(_guard) => {
                let current_generation = self.entry.read().as_ref().map(|e| e.generation);
                if current_generation != seen_generation {
                    if let Some(keys) = self.servable(now) {
                        return Ok(keys);
                    }
                }
                debug!(kid = %kid, "Unknown kid, refreshing key set");
                self.refresh_locked(now).await
            }
            Err(_) => self.wait_for_in_flight(now).await,
        }
    }

    /// Fetch the initial key set (startup warm-up).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unavailable`] if the first fetch fails.
    pub async fn prime(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, KeyError> {
        self.get(now).await
    }

    /// Describe the cache state at `now`.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> CacheStatus {
        let entry = self.entry.read();
        let Some(e) = entry.as_ref() else {
            return CacheStatus::Empty;
        };
        let age = e.age(now);
        let age_secs = age.as_secs();
        if age < self.ttl {
            CacheStatus::Fresh {
                age_secs,
                keys: e.keys.len(),
            }
        } else if age < self.ttl + self.max_stale {
            CacheStatus::Stale {
                age_secs,
                keys: e.keys.len(),
            }
        } else {
            CacheStatus::Expired { age_secs }
        }
    }

    /// Total fetch attempts made against the key source.
    #[must_use]
    pub fn refresh_attempts(&self) -> u64 {
        self.refresh_attempts.load(Ordering::Relaxed)
    }

    fn fresh(&self, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        let entry = self.entry.read();
        entry
            .as_ref()
            .filter(|e| e.age(now) < self.ttl)
            .map(|e| Arc::clone(&e.keys))
    }

    fn servable(&self, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        let entry = self.entry.read();
        entry
            .as_ref()
            .filter(|e| e.age(now) < self.ttl + self.max_stale)
            .map(|e| Arc::clone(&e.keys))
    }

    /// Perform one fetch. Caller must hold `refresh_lock`.
    async fn refresh_locked(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, KeyError> {
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
        let origin = self.fetcher.origin();

        match self.fetcher.fetch().await {
            Ok(keys) => {
                let set = Arc::new(KeySet::new(keys, origin, now));
                {
                    let mut entry = self.entry.write();
                    let generation = entry.as_ref().map_or(1, |e| e.generation + 1);
                    *entry = Some(CacheEntry {
                        keys: Arc::clone(&set),
                        fetched_at: now,
                        generation,
                    });
                }
                telemetry_metrics::counter!("tool_gate_key_refresh_total", "result" => "success")
                    .increment(1);
                info!(origin = %origin, keys = set.len(), "Key set refreshed");
                Ok(set)
            }
            Err(e) => {
                telemetry_metrics::counter!("tool_gate_key_refresh_total", "result" => "failure")
                    .increment(1);
                if let Some(stale) = self.servable(now) {
                    warn!(origin = %origin, error = %e, "Key refresh failed, serving stale key set");
                    Ok(stale)
                } else {
                    error!(origin = %origin, error = %e, "Key refresh failed and no servable key set");
                    Err(KeyError::Unavailable)
                }
            }
        }
    }

    /// Wait (bounded) for the in-flight fetch, then serve whatever it left.
    async fn wait_for_in_flight(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, KeyError> {
        match tokio::time::timeout(self.cold_start_wait, self.refresh_lock.lock()).await {
            Ok(_guard) => self.servable(now).ok_or(KeyError::Unavailable),
            Err(_) => {
                warn!(
                    waited_ms = self.cold_start_wait.as_millis(),
                    "Timed out waiting for in-flight key refresh"
                );
                self.servable(now).ok_or(KeyError::Unavailable)
            }
        }
    }
}
