//! Time-to-live store for API responses.
//!
//! This module provides the [`CacheStore`] used by the request executor to
//! reuse payloads for as long as the server declared them fresh.

use std::{collections::HashMap, sync::Arc};

use log::debug;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Duration, Instant},
};

/// Default interval between two sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A cached value and the instant it stops being fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    /// `None` never expires, only [`CacheStore::clear`] removes it.
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Time left before expiry, `None` for entries that never expire.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Keyed store whose entries expire after a per-entry time to live.
///
/// Expired entries are hidden from [`CacheStore::get`] right away and are
/// physically evicted by a background sweep, so keys that are written once
/// and never read again do not pile up.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::rest::CacheStore;
/// use std::time::Duration;
///
/// # async fn example() {
/// let mut cache: CacheStore<String> = CacheStore::new();
/// cache.start_sweep_task(Duration::from_secs(60));
///
/// cache.set("/clans/%23ABC", "payload".to_string(), Duration::from_secs(120)).await;
/// assert!(cache.get("/clans/%23ABC").await.is_some());
/// # }
/// ```
pub struct CacheStore<V> {
    /// Thread-safe reference to the entries, shared with the sweep task
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
    /// Handle of the sweep task, aborted when the store is dropped
    sweep_handle: Option<JoinHandle<()>>,
}

impl<V: Clone + Send + 'static> CacheStore<V> {
    pub fn new() -> Self {
        CacheStore {
            entries: Arc::new(Mutex::new(HashMap::new())),
            sweep_handle: None,
        }
    }

    /// Starts a background task that evicts expired entries every `interval`.
    ///
    /// Calling it again replaces the previous sweep task.
    pub fn start_sweep_task(&mut self, interval: Duration) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }

        let entries = Arc::clone(&self.entries);
        self.sweep_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(interval);
            loop {
                interval.tick().await;
                let evicted = sweep(&mut *entries.lock().await, Instant::now());
                if evicted > 0 {
                    debug!("evicted {} expired cache entries", evicted);
                }
            }
        }));
    }

    /// Returns the entry for `key` if it exists and has not expired.
    pub async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Stores `value` under `key` for `ttl`.
    ///
    /// A zero `ttl` stores an entry that never expires.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        self.entries
            .lock()
            .await
            .insert(key.to_owned(), CacheEntry { value, expires_at });
    }

    /// Removes `key`, returning whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of stored entries, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<V: Clone + Send + 'static> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for CacheStore<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

/// Removes every entry expired at `now`, returns how many were removed.
fn sweep<V>(entries: &mut HashMap<String, CacheEntry<V>>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}
