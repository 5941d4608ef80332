use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use super::ResourceKey;
use crate::store::JsonStore;

/// Store file holding persisted cache entries.
const CACHE_FILE: &str = "cache";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Unknown resource key: {0}")]
    UnknownKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: i64,
    #[serde(default)]
    pub etag: Option<String>,
    /// Set by `invalidate`; reported stale regardless of TTL.
    #[serde(default)]
    pub invalidated: bool,
}

impl<T> CachedData<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
            ttl_secs: ttl.num_seconds(),
            etag: None,
            invalidated: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Negative ages come from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            let remaining_mins = minutes % 60;
            if remaining_mins >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            let remaining_hours = (minutes % 1440) / 60;
            if remaining_hours >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cached_at + Duration::seconds(self.ttl_secs)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.invalidated || now >= self.expires_at()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// Result of a non-blocking cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub value: Option<Value>,
    pub freshness: Freshness,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl CacheRead {
    fn missing() -> Self {
        Self {
            value: None,
            freshness: Freshness::Missing,
            fetched_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: ResourceKey,
    entry: CachedData<Value>,
}

/// Progress of a key's refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    /// Handed to the refresher, fetch not started yet.
    Requested,
    /// A fetch is running; `epoch` is the key's invalidation count at its start.
    InFlight { epoch: u64 },
}

/// Permission to fetch a key, returned by `ResourceCache::begin_refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshClaim {
    Claimed(RefreshTicket),
    /// Another fetch for the key is running; wait with `refresh_settled`.
    Busy,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ResourceKey, CachedData<Value>>,
    /// Logical clock for LRU ordering.
    last_used: HashMap<ResourceKey, u64>,
    tick: u64,
    /// Keys a queued event depends on; never evicted.
    pinned: HashSet<ResourceKey>,
    /// Keys with one outstanding refresh.
    refreshing: HashMap<ResourceKey, RefreshState>,
    /// Invalidation count per key, so a fetch started earlier cannot clear a
    /// later invalidation.
    epochs: HashMap<ResourceKey, u64>,
    refresh_tx: Option<mpsc::UnboundedSender<ResourceKey>>,
    /// Entries changed since the last persist.
    dirty: bool,
}

impl CacheState {
    fn touch(&mut self, key: &ResourceKey) {
        self.tick += 1;
        self.last_used.insert(key.clone(), self.tick);
    }

    fn insert(&mut self, key: ResourceKey, entry: CachedData<Value>, capacity: usize) {
        self.touch(&key);
        self.entries.insert(key, entry);
        self.dirty = true;
        self.evict(capacity);
    }

    /// Mark `key` as refreshing and hand it to the refresher. Returns false
    /// if a refresh is already outstanding or nobody is listening.
    fn schedule_refresh(&mut self, key: &ResourceKey) -> bool {
        if self.refreshing.contains_key(key) {
            return false;
        }
        let Some(tx) = self.refresh_tx.as_ref() else {
            return false;
        };
        if tx.send(key.clone()).is_err() {
            debug!(key = %key, "Refresh channel closed");
            return false;
        }
        self.refreshing.insert(key.clone(), RefreshState::Requested);
        true
    }

    fn epoch(&self, key: &ResourceKey) -> u64 {
        self.epochs.get(key).copied().unwrap_or(0)
    }

    fn is_fetching(&self, key: &ResourceKey) -> bool {
        matches!(self.refreshing.get(key), Some(RefreshState::InFlight { .. }))
    }

    fn evict(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .keys()
                .filter(|k| !self.pinned.contains(*k))
                .min_by_key(|k| self.last_used.get(*k).copied().unwrap_or(0))
                .cloned();
            match victim {
                Some(key) => {
                    debug!(key = %key, "Evicting least recently used cache entry");
                    self.entries.remove(&key);
                    self.last_used.remove(&key);
                    self.dirty = true;
                }
                None => {
                    warn!(entries = self.entries.len(), capacity, "Cache over capacity, all entries pinned");
                    break;
                }
            }
        }
    }
}

/// Bounded, TTL-aware cache of server resource snapshots.
pub struct ResourceCache {
    state: Mutex<CacheState>,
    capacity: usize,
    store: Option<JsonStore>,
    /// Woken whenever a fetch finishes, successfully or not.
    refresh_done: Notify,
}

impl ResourceCache {
    /// In-memory cache with no persistence.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            store: None,
            refresh_done: Notify::new(),
        }
    }

    /// Cache backed by `store`, restoring previously persisted entries.
    pub fn open(store: JsonStore, capacity: usize) -> Result<Self> {
        let mut cache = Self::new(capacity);
        let persisted: Vec<PersistedEntry> = match store.load(CACHE_FILE) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                // The cache is only an accelerator; start empty rather than fail.
                warn!(error = %e, "Discarding unreadable cache file");
                Vec::new()
            }
        };
        {
            let state = cache.state.get_mut().unwrap_or_else(|e| e.into_inner());
            for PersistedEntry { key, entry } in persisted {
                state.touch(&key);
                state.entries.insert(key, entry);
            }
            state.evict(cache.capacity);
            state.dirty = false;
            debug!(entries = state.entries.len(), "Loaded resource cache");
        }
        cache.store = Some(store);
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route stale-read refresh requests to `tx`.
    pub fn attach_refresher(&self, tx: mpsc::UnboundedSender<ResourceKey>) {
        let mut state = self.lock();
        state.refresh_tx = Some(tx);
        state.refreshing.retain(|_, r| *r != RefreshState::Requested);
    }

    pub fn detach_refresher(&self) {
        let mut state = self.lock();
        state.refresh_tx = None;
        state.refreshing.retain(|_, r| *r != RefreshState::Requested);
    }

    /// Read without blocking. Stale entries are returned with one coalesced
    /// background refresh scheduled; missing entries are left to the caller.
    pub fn get(&self, key: &ResourceKey) -> CacheRead {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &ResourceKey, now: DateTime<Utc>) -> CacheRead {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(key) else {
            return CacheRead::missing();
        };
        let stale = entry.is_stale_at(now);
        let read = CacheRead {
            value: Some(entry.data.clone()),
            freshness: if stale { Freshness::Stale } else { Freshness::Fresh },
            fetched_at: Some(entry.cached_at),
        };
        state.touch(key);
        if stale && state.schedule_refresh(key) {
            debug!(key = %key, "Stale read, refresh scheduled");
        }
        read
    }

    pub fn put(&self, key: ResourceKey, value: Value, ttl: Duration) {
        self.put_with_etag(key, value, ttl, None);
    }

    /// Replace the entry and reset `cached_at`. A request still waiting for
    /// the refresher is satisfied; a fetch already running finishes on its own.
    pub fn put_with_etag(&self, key: ResourceKey, value: Value, ttl: Duration, etag: Option<String>) {
        let mut entry = CachedData::new(value, ttl);
        entry.etag = etag;
        let mut state = self.lock();
        if state.refreshing.get(&key) == Some(&RefreshState::Requested) {
            state.refreshing.remove(&key);
        }
        state.insert(key, entry, self.capacity);
    }

    /// Force the next read of `key` to report `Stale`. Returns false if absent.
    pub fn invalidate(&self, key: &ResourceKey) -> bool {
        let mut state = self.lock();
        *state.epochs.entry(key.clone()).or_insert(0) += 1;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.invalidated = true;
                state.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Ask for a refresh explicitly (e.g. after a `Missing` read). Coalesced
    /// with any refresh already outstanding.
    pub fn request_refresh(&self, key: &ResourceKey) -> bool {
        self.lock().schedule_refresh(key)
    }

    /// Claim `key` for a fetch performed by the caller. A pending request is
    /// taken over; a fetch already running makes this `Busy`.
    pub fn begin_refresh(&self, key: &ResourceKey) -> RefreshClaim {
        let mut state = self.lock();
        if state.is_fetching(key) {
            return RefreshClaim::Busy;
        }
        let epoch = state.epoch(key);
        state.refreshing.insert(key.clone(), RefreshState::InFlight { epoch });
        RefreshClaim::Claimed(RefreshTicket { epoch })
    }

    /// Store the result of a claimed fetch. If `key` was invalidated after the
    /// fetch started, the new value is kept but still reads as `Stale`.
    pub fn complete_refresh(&self, key: ResourceKey, value: Value, ttl: Duration, ticket: RefreshTicket) {
        let mut entry = CachedData::new(value, ttl);
        {
            let mut state = self.lock();
            if state.epoch(&key) != ticket.epoch {
                debug!(key = %key, "Invalidated during refresh, keeping entry stale");
                entry.invalidated = true;
            }
            state.refreshing.remove(&key);
            state.insert(key, entry, self.capacity);
        }
        self.refresh_done.notify_waiters();
    }

    /// Release the refresh claim after a failed fetch so a later read retries.
    pub fn refresh_failed(&self, key: &ResourceKey) {
        self.lock().refreshing.remove(key);
        self.refresh_done.notify_waiters();
    }

    /// Drop a request the refresher will not serve. A running fetch is left alone.
    pub fn cancel_refresh_request(&self, key: &ResourceKey) {
        let mut state = self.lock();
        if state.refreshing.get(key) == Some(&RefreshState::Requested) {
            state.refreshing.remove(key);
        }
    }

    pub fn is_refreshing(&self, key: &ResourceKey) -> bool {
        self.lock().refreshing.contains_key(key)
    }

    /// A stale read asked for `key` and no fetch has started yet.
    pub fn is_refresh_requested(&self, key: &ResourceKey) -> bool {
        self.lock().refreshing.get(key) == Some(&RefreshState::Requested)
    }

    /// Wait until no fetch for `key` is running.
    pub async fn refresh_settled(&self, key: &ResourceKey) {
        loop {
            let notified = self.refresh_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.lock().is_fetching(key) {
                return;
            }
            notified.await;
        }
    }

    /// Present, within its TTL and not invalidated.
    pub fn is_fresh(&self, key: &ResourceKey) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_stale())
    }

    /// Replace the set of keys that must survive eviction.
    pub fn set_pinned(&self, keys: impl IntoIterator<Item = ResourceKey>) {
        let mut state = self.lock();
        state.pinned = keys.into_iter().collect();
        state.evict(self.capacity);
    }

    pub fn etag(&self, key: &ResourceKey) -> Option<String> {
        self.lock().entries.get(key).and_then(|e| e.etag.clone())
    }

    pub fn age_display(&self, key: &ResourceKey) -> Option<String> {
        self.lock().entries.get(key).map(|e| e.age_display())
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write current entries to the backing store, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(ref store) = self.store else {
            return Ok(());
        };
        let entries: Vec<PersistedEntry> = {
            let mut state = self.lock();
            state.dirty = false;
            state
                .entries
                .iter()
                .map(|(key, entry)| PersistedEntry {
                    key: key.clone(),
                    entry: entry.clone(),
                })
                .collect()
        };
        if let Err(e) = store.save(CACHE_FILE, &entries) {
            self.lock().dirty = true;
            return Err(e);
        }
        debug!(entries = entries.len(), "Persisted resource cache");
        Ok(())
    }

    /// Persist only if something changed since the last write.
    pub fn persist_if_dirty(&self) -> Result<()> {
        if self.store.is_none() || !self.lock().dirty {
            return Ok(());
        }
        self.persist()
    }

    #[cfg(test)]
    fn backdate(&self, key: &ResourceKey, by: Duration) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.cached_at = entry.cached_at - by;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
