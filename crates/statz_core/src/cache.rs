//! Read-through cache of materialized statistic rows.
//!
//! Entries are keyed by (player, kind) and hold every row of that pair.
//! They never expire by time: only flush activity, explicit invalidation,
//! player eviction or a full clear change them.
//!
//! Each key carries a generation counter. Invalidations and refreshes bump
//! it, and a load that started under an older generation is not installed,
//! so a read that raced a flush cannot put pre-flush rows back as fresh.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::RowStore;
use crate::types::{PlayerId, StatKind, StatRecord};

pub type CacheKey = (PlayerId, StatKind);

/// How the cache reacts when a flush touches a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Reload from the store right after the flush.
    #[default]
    Eager,
    /// Mark stale and reload on the next read.
    Lazy,
}

/// All rows of one (player, kind) pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    records: Arc<Vec<StatRecord>>,
    fresh: bool,
    loaded_at: Instant,
}

impl CacheEntry {
    fn new(records: Vec<StatRecord>) -> Self {
        Self {
            records: Arc::new(records),
            fresh: true,
            loaded_at: Instant::now(),
        }
    }

    fn stale(&self) -> Self {
        Self {
            records: self.records.clone(),
            fresh: false,
            loaded_at: self.loaded_at,
        }
    }

    pub fn records(&self) -> &[StatRecord] {
        &self.records
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    entry: Option<Arc<CacheEntry>>,
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub invalidations: u64,
}

/// Read-through cache of persisted rows, keyed by (player, kind).
///
/// Each key holds an immutable [`CacheEntry`] snapshot behind an `Arc`.
/// Readers clone the `Arc` and never see a half-updated entry; refreshes
/// build a new snapshot and swap it in whole. Every key also carries a
/// generation counter that is bumped on invalidation, so a load that
/// started before a flush cannot install the older rows afterwards.
///
/// After a flush the scheduler calls [`CachingManager::on_flushed`] for
/// every touched key. With [`RefreshMode::Eager`] keys that are already
/// cached are reloaded straight away; with [`RefreshMode::Lazy`] they are
/// only marked stale and reloaded by the next read. Keys nobody has read
/// are never loaded.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use statz_core::{CachingManager, MemoryRowStore, PlayerId, RefreshMode, StatKind};
/// # async fn example() -> Result<(), statz_core::StoreError> {
/// let cache = CachingManager::new(Arc::new(MemoryRowStore::new()), RefreshMode::Eager);
/// let player = PlayerId::new();
///
/// let entry = cache.refresh(player, StatKind::Joins).await?;
/// assert!(entry.is_fresh());
/// assert!(cache.get(player, StatKind::Joins).is_some());
/// # Ok(())
/// # }
/// ```
pub struct CachingManager {
    store: Arc<dyn RowStore>,
    slots: DashMap<CacheKey, CacheSlot>,
    refresh_mode: RefreshMode,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    invalidations: AtomicU64,
}

impl CachingManager {
    pub fn new(store: Arc<dyn RowStore>, refresh_mode: RefreshMode) -> Self {
        Self {
            store,
            slots: DashMap::new(),
            refresh_mode,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Returns the current entry, fresh or stale.
    pub fn get(&self, player_id: PlayerId, kind: StatKind) -> Option<Arc<CacheEntry>> {
        self.slots
            .get(&(player_id, kind))
            .and_then(|slot| slot.entry.clone())
    }

    /// Returns the entry only if it is fresh, counting hits and misses.
    pub(crate) fn lookup(&self, player_id: PlayerId, kind: StatKind) -> Option<Arc<CacheEntry>> {
        match self.get(player_id, kind) {
            Some(entry) if entry.is_fresh() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Loads the rows of a missed key and installs them unless the key was
    /// invalidated while the load was in flight.
    pub(crate) async fn load(
        &self,
        player_id: PlayerId,
        kind: StatKind,
    ) -> Result<Arc<CacheEntry>, StoreError> {
        let key = (player_id, kind);
        let generation = self.slots.entry(key).or_default().generation;
        self.fetch_and_install(key, generation).await
    }

    /// Reloads from the store and replaces any existing entry.
    pub async fn refresh(
        &self,
        player_id: PlayerId,
        kind: StatKind,
    ) -> Result<Arc<CacheEntry>, StoreError> {
        let key = (player_id, kind);
        let generation = {
            let mut slot = self.slots.entry(key).or_default();
            slot.generation += 1;
            slot.generation
        };
        self.fetch_and_install(key, generation).await
    }

    /// Marks an entry stale without reloading it.
    pub fn invalidate(&self, player_id: PlayerId, kind: StatKind) {
        if let Some(mut slot) = self.slots.get_mut(&(player_id, kind)) {
            slot.generation += 1;
            if let Some(entry) = slot.entry.take() {
                slot.entry = Some(Arc::new(entry.stale()));
            }
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reacts to a flush that persisted rows for this key.
    pub async fn on_flushed(&self, player_id: PlayerId, kind: StatKind) {
        let cached = self.get(player_id, kind).is_some();
        if cached && self.refresh_mode == RefreshMode::Eager {
            if let Err(e) = self.refresh(player_id, kind).await {
                warn!(
                    "Refresh of {} for {} failed, marking stale: {}",
                    kind, player_id, e
                );
                self.invalidate(player_id, kind);
            }
        } else {
            self.invalidate(player_id, kind);
        }
    }

    /// Drops every entry of a player.
    pub fn evict_player(&self, player_id: PlayerId) {
        self.slots.retain(|(p, _), _| *p != player_id);
        debug!("Evicted cached statistics of {}", player_id);
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn refresh_mode(&self) -> RefreshMode {
        self.refresh_mode
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.iter().filter(|s| s.entry.is_some()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    async fn fetch_and_install(
        &self,
        key: CacheKey,
        generation: u64,
    ) -> Result<Arc<CacheEntry>, StoreError> {
        let records = self.store.read_all(key.0, key.1).await?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CacheEntry::new(records));

        match self.slots.get_mut(&key) {
            Some(mut slot) if slot.generation == generation => {
                slot.entry = Some(entry.clone());
            }
            _ => debug!(
                "Discarding load of {} for {}: invalidated while loading",
                key.1, key.0
            ),
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::store::MemoryRowStore;
    use crate::types::{Dimensions, StatValue};

    async fn seeded(player: PlayerId, value: f64) -> Arc<MemoryRowStore> {
        let store = Arc::new(MemoryRowStore::new());
        let registry = SchemaRegistry::builtin();
        store
            .write_batch(
                registry.schema(StatKind::Joins).unwrap(),
                vec![StatRecord::new(player, StatKind::Joins, Dimensions::new(), value)],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_installs_fresh_entry() {
        let player = PlayerId::new();
        let cache = CachingManager::new(seeded(player, 3.0).await, RefreshMode::Eager);

        assert!(cache.lookup(player, StatKind::Joins).is_none());
        cache.load(player, StatKind::Joins).await.unwrap();

        let entry = cache.lookup(player, StatKind::Joins).unwrap();
        assert!(entry.is_fresh());
        assert_eq!(entry.records()[0].value, StatValue::Number(3.0));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale_and_keeps_rows() {
        let player = PlayerId::new();
        let cache = CachingManager::new(seeded(player, 3.0).await, RefreshMode::Lazy);
        cache.load(player, StatKind::Joins).await.unwrap();

        cache.invalidate(player, StatKind::Joins);

        let entry = cache.get(player, StatKind::Joins).unwrap();
        assert!(!entry.is_fresh());
        assert_eq!(entry.records().len(), 1);
        assert!(cache.lookup(player, StatKind::Joins).is_none());
    }

    #[tokio::test]
    async fn test_load_racing_invalidation_is_not_installed() {
        let player = PlayerId::new();
        let cache = CachingManager::new(seeded(player, 3.0).await, RefreshMode::Lazy);
        let key = (player, StatKind::Joins);

        let generation = cache.slots.entry(key).or_default().generation;
        cache.invalidate(player, StatKind::Joins);
        cache.fetch_and_install(key, generation).await.unwrap();

        assert!(cache.get(player, StatKind::Joins).is_none());
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot_across_refresh() {
        let player = PlayerId::new();
        let store = seeded(player, 3.0).await;
        let cache = CachingManager::new(store.clone(), RefreshMode::Eager);
        let before = cache.load(player, StatKind::Joins).await.unwrap();

        let registry = SchemaRegistry::builtin();
        store
            .write_batch(
                registry.schema(StatKind::Joins).unwrap(),
                vec![StatRecord::new(player, StatKind::Joins, Dimensions::new(), 2.0)],
            )
            .await
            .unwrap();
        cache.on_flushed(player, StatKind::Joins).await;

        assert_eq!(before.records()[0].value, StatValue::Number(3.0));
        let after = cache.get(player, StatKind::Joins).unwrap();
        assert_eq!(after.records()[0].value, StatValue::Number(5.0));
        assert!(after.is_fresh());
    }

    #[tokio::test]
    async fn test_evict_player_only_drops_that_player() {
        let a = PlayerId::new();
        let b = PlayerId::new();
        let store = seeded(a, 1.0).await;
        let cache = CachingManager::new(store, RefreshMode::Eager);
        cache.load(a, StatKind::Joins).await.unwrap();
        cache.load(b, StatKind::Joins).await.unwrap();

        cache.evict_player(a);

        assert!(cache.get(a, StatKind::Joins).is_none());
        assert!(cache.get(b, StatKind::Joins).is_some());
    }
}
