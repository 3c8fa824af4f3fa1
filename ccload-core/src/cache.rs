//! In-memory channel cache
//!
//! Read-through cache in front of the store for the hot routing queries:
//! channel topology by model and type, per-channel API key lists, and the
//! cooldown maps. Topology refreshes on a TTL with double-checked
//! locking; the cooldown sub-cache runs a shorter TTL of its own so
//! backoff state stays fresher than the topology snapshot.
//!
//! Every public read hands out owned clones. Callers may mutate whatever
//! they receive; the cached state never observes it. On a refresh failure
//! the cache degrades to a direct store call instead of surfacing an
//! error of its own.

use crate::db::Store;
use crate::error::Result;
use crate::types::{ApiKey, Channel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const DEFAULT_TOPOLOGY_TTL: Duration = Duration::from_secs(60);
const DEFAULT_COOLDOWN_TTL: Duration = Duration::from_secs(30);

/// Hit/miss/invalidation counters for one sub-cache.
///
/// Plain atomics; never taken under the cache locks.
#[derive(Default)]
struct SubCacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl SubCacheCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidated(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SubCacheStats {
        SubCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Counter snapshot for one sub-cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Counter snapshot across all sub-caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub topology: SubCacheStats,
    pub api_keys: SubCacheStats,
    pub cooldowns: SubCacheStats,
}

/// Topology snapshot plus the per-channel API key lists; one lock covers
/// both, the cooldown maps live behind their own.
struct TopologyState {
    all_channels: Vec<Channel>,
    by_model: HashMap<String, Vec<Channel>>,
    by_type: HashMap<String, Vec<Channel>>,
    last_update: Option<Instant>,
    api_keys: HashMap<i64, Vec<ApiKey>>,
}

impl TopologyState {
    fn empty() -> Self {
        Self {
            all_channels: Vec::new(),
            by_model: HashMap::new(),
            by_type: HashMap::new(),
            last_update: None,
            api_keys: HashMap::new(),
        }
    }

    fn stale(&self, ttl: Duration) -> bool {
        self.last_update.map_or(true, |t| t.elapsed() > ttl)
    }

    fn rebuild(&mut self, channels: Vec<Channel>) {
        let mut by_model: HashMap<String, Vec<Channel>> = HashMap::new();
        let mut by_type: HashMap<String, Vec<Channel>> = HashMap::new();
        for channel in &channels {
            for entry in &channel.model_entries {
                by_model
                    .entry(entry.model.clone())
                    .or_default()
                    .push(channel.clone());
            }
            by_type
                .entry(channel.channel_type.clone())
                .or_default()
                .push(channel.clone());
        }
        self.all_channels = channels;
        self.by_model = by_model;
        self.by_type = by_type;
        self.last_update = Some(Instant::now());
    }
}

struct CooldownState {
    channels: HashMap<i64, i64>,
    keys: HashMap<i64, HashMap<i64, i64>>,
    last_update: Option<Instant>,
}

impl CooldownState {
    fn empty() -> Self {
        Self {
            channels: HashMap::new(),
            keys: HashMap::new(),
            last_update: None,
        }
    }

    fn stale(&self, ttl: Duration) -> bool {
        self.last_update.map_or(true, |t| t.elapsed() > ttl)
    }
}

/// Read-through cache over a [`Store`].
pub struct ChannelCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    cooldown_ttl: Duration,
    topology: RwLock<TopologyState>,
    cooldowns: Mutex<CooldownState>,
    topology_counters: SubCacheCounters,
    api_key_counters: SubCacheCounters,
    cooldown_counters: SubCacheCounters,
}

impl ChannelCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_ttl(store, DEFAULT_TOPOLOGY_TTL, DEFAULT_COOLDOWN_TTL)
    }

    pub fn with_ttl(store: Arc<dyn Store>, ttl: Duration, cooldown_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cooldown_ttl,
            topology: RwLock::new(TopologyState::empty()),
            cooldowns: Mutex::new(CooldownState::empty()),
            topology_counters: SubCacheCounters::default(),
            api_key_counters: SubCacheCounters::default(),
            cooldown_counters: SubCacheCounters::default(),
        }
    }

    // ============================================
    // Topology reads
    // ============================================

    /// Enabled channels serving `model` (`"*"` = all), filtered against
    /// the cooldown sub-cache so backoff takes effect before the next
    /// topology refresh.
    pub async fn get_enabled_channels_by_model(&self, model: &str) -> Result<Vec<Channel>> {
        let snapshot = self
            .read_topology(|state| {
                if model == "*" {
                    state.all_channels.clone()
                } else {
                    state.by_model.get(model).cloned().unwrap_or_default()
                }
            })
            .await;

        let channels = match snapshot {
            Some(channels) => channels,
            // Refresh failed: degrade to the store without caching
            None => return self.store.get_enabled_channels_by_model(model).await,
        };
        self.filter_cooling(channels).await
    }

    /// Enabled channels of one `channel_type`, cooldown-filtered
    pub async fn get_enabled_channels_by_type(&self, channel_type: &str) -> Result<Vec<Channel>> {
        let snapshot = self
            .read_topology(|state| state.by_type.get(channel_type).cloned().unwrap_or_default())
            .await;

        let channels = match snapshot {
            Some(channels) => channels,
            None => return self.store.get_enabled_channels_by_type(channel_type).await,
        };
        self.filter_cooling(channels).await
    }

    /// Run `select` against a fresh topology snapshot, refreshing under
    /// the write lock (double-checked) when the TTL has lapsed. Returns
    /// `None` when the snapshot is stale and the reload failed.
    async fn read_topology<T>(&self, select: impl Fn(&TopologyState) -> T) -> Option<T> {
        {
            let state = self.topology.read().await;
            if !state.stale(self.ttl) {
                self.topology_counters.hit();
                return Some(select(&state));
            }
        }

        self.topology_counters.miss();
        let mut state = self.topology.write().await;
        // Another task may have refreshed while we waited for the lock
        if state.stale(self.ttl) {
            match self.store.get_enabled_channels_by_model("*").await {
                Ok(channels) => state.rebuild(channels),
                Err(e) => {
                    tracing::warn!(error = %e, "Channel cache refresh failed; falling back to store");
                    return None;
                }
            }
        }
        Some(select(&state))
    }

    /// Drop channels the cooldown sub-cache still considers cooling
    async fn filter_cooling(&self, channels: Vec<Channel>) -> Result<Vec<Channel>> {
        if channels.is_empty() {
            return Ok(channels);
        }
        let cooling = self.get_all_channel_cooldowns().await?;
        let now = crate::types::now_secs();
        Ok(channels
            .into_iter()
            .filter(|c| cooling.get(&c.id).map_or(true, |until| *until <= now))
            .collect())
    }

    /// Single-channel config read; deliberately bypasses the cache so an
    /// admin edit is visible immediately.
    pub async fn get_config(&self, id: i64) -> Result<Channel> {
        self.store.get_channel(id).await
    }

    // ============================================
    // API keys
    // ============================================

    /// Keys of one channel; cached on first access, invalidated explicitly
    pub async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        {
            let state = self.topology.read().await;
            if let Some(keys) = state.api_keys.get(&channel_id) {
                self.api_key_counters.hit();
                return Ok(keys.clone());
            }
        }

        self.api_key_counters.miss();
        let keys = self.store.get_api_keys(channel_id).await?;
        let mut state = self.topology.write().await;
        state.api_keys.insert(channel_id, keys.clone());
        Ok(keys)
    }

    /// Warm the key lists for every channel in one store round-trip
    pub async fn prefill_api_keys(&self) -> Result<()> {
        let all = self.store.get_all_api_keys().await?;
        let mut state = self.topology.write().await;
        state.api_keys = all;
        Ok(())
    }

    // ============================================
    // Cooldowns
    // ============================================

    /// `channel_id -> cooldown_until` through the cooldown sub-cache
    pub async fn get_all_channel_cooldowns(&self) -> Result<HashMap<i64, i64>> {
        let mut state = self.cooldowns.lock().await;
        if state.stale(self.cooldown_ttl) {
            self.cooldown_counters.miss();
            self.refresh_cooldowns(&mut state).await?;
        } else {
            self.cooldown_counters.hit();
        }
        Ok(state.channels.clone())
    }

    /// `channel_id -> key_index -> cooldown_until` through the sub-cache
    pub async fn get_all_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        let mut state = self.cooldowns.lock().await;
        if state.stale(self.cooldown_ttl) {
            self.cooldown_counters.miss();
            self.refresh_cooldowns(&mut state).await?;
        } else {
            self.cooldown_counters.hit();
        }
        Ok(state.keys.clone())
    }

    async fn refresh_cooldowns(&self, state: &mut CooldownState) -> Result<()> {
        let now = crate::types::now_secs();
        state.channels = self.store.get_all_channel_cooldowns(now).await?;
        state.keys = self.store.get_all_key_cooldowns(now).await?;
        state.last_update = Some(Instant::now());
        Ok(())
    }

    // ============================================
    // Invalidation
    // ============================================

    /// Force the next topology read to reload from the store
    pub async fn invalidate_cache(&self) {
        let mut state = self.topology.write().await;
        state.last_update = None;
        self.topology_counters.invalidated();
    }

    /// Drop the cached key list of one channel
    pub async fn invalidate_api_keys_cache(&self, channel_id: i64) {
        let mut state = self.topology.write().await;
        state.api_keys.remove(&channel_id);
        self.api_key_counters.invalidated();
    }

    /// Drop every cached key list
    pub async fn invalidate_all_api_keys_cache(&self) {
        let mut state = self.topology.write().await;
        state.api_keys.clear();
        self.api_key_counters.invalidated();
    }

    /// Force the next cooldown read to reload from the store
    pub async fn invalidate_cooldown_cache(&self) {
        let mut state = self.cooldowns.lock().await;
        state.last_update = None;
        self.cooldown_counters.invalidated();
    }

    /// Counter snapshot for observability endpoints
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            topology: self.topology_counters.snapshot(),
            api_keys: self.api_key_counters.snapshot(),
            cooldowns: self.cooldown_counters.snapshot(),
        }
    }
}
