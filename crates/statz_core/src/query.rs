//! Read and write facade used by commands, GUIs and reporting.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::cache::{CacheEntry, CachingManager};
use crate::error::StatzResult;
use crate::flush::{FlushMode, FlushReport, FlushScheduler};
use crate::queue::{Enqueued, UpdateQueue};
use crate::types::{Dimensions, PlayerId, StatKind, StatRecord, StatValue};

/// Matches rows whose dimension `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRequirement {
    pub column: String,
    pub value: String,
}

impl RowRequirement {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &StatRecord) -> bool {
        record.dimension(&self.column) == Some(self.value.as_str())
    }
}

/// Rows of one (player, kind) pair that passed the requested filters.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub kind: StatKind,
    records: Vec<StatRecord>,
}

impl PlayerInfo {
    fn from_entry(player_id: PlayerId, kind: StatKind, entry: &CacheEntry, filters: &[RowRequirement]) -> Self {
        let records = entry
            .records()
            .iter()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .cloned()
            .collect();
        Self {
            player_id,
            kind,
            records,
        }
    }

    pub fn records(&self) -> &[StatRecord] {
        &self.records
    }

    pub fn has_rows(&self) -> bool {
        !self.records.is_empty()
    }

    /// Sum of the numeric values of all rows.
    pub fn total_value(&self) -> f64 {
        self.records.iter().filter_map(|r| r.value.as_number()).sum()
    }

    pub fn max_value(&self) -> Option<f64> {
        self.records
            .iter()
            .filter_map(|r| r.value.as_number())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Text value of the most recently written row.
    pub fn text_value(&self) -> Option<&str> {
        self.records
            .iter()
            .filter(|r| r.value.as_text().is_some())
            .max_by_key(|r| r.timestamp)
            .and_then(|r| r.value.as_text())
    }
}

/// Cheap-to-clone handle over the queue, cache and scheduler.
///
/// This is what the rest of an application talks to. Writes go into the
/// update queue and return immediately; reads come from the cache and fall
/// back to the row store on a miss. Reads only see persisted rows, so an
/// update becomes visible after the flush that writes it (or after
/// [`StatzApi::flush_now`]).
///
/// Obtain one from [`StatzService::api`](crate::StatzService::api).
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use statz_core::{dimensions, MemoryRowStore, PlayerId, RowRequirement, StatKind, StatzConfig, StatzService};
/// # async fn example() -> statz_core::StatzResult<()> {
/// let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new()))?;
/// let api = service.api();
/// let player = PlayerId::new();
///
/// api.set_player_info(
///     player,
///     StatKind::DistanceTravelled,
///     dimensions([("world", "world"), ("moveType", "WALK")]),
///     12.5,
/// )?;
/// api.flush_now().await?;
///
/// let walked = api
///     .total(player, StatKind::DistanceTravelled, &[RowRequirement::new("moveType", "WALK")])
///     .await?;
/// assert_eq!(walked, 12.5);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StatzApi {
    queue: Arc<UpdateQueue>,
    cache: Arc<CachingManager>,
    scheduler: Arc<FlushScheduler>,
}

impl StatzApi {
    pub fn new(queue: Arc<UpdateQueue>, cache: Arc<CachingManager>, scheduler: Arc<FlushScheduler>) -> Self {
        Self {
            queue,
            cache,
            scheduler,
        }
    }

    /// Returns the persisted rows, loading them into the cache on a miss.
    ///
    /// Updates still waiting in the queue are not visible. Rows that do not
    /// satisfy every filter are left out.
    ///
    /// # Errors
    ///
    /// [`StatzError::Store`](crate::StatzError::Store) when the rows had to
    /// be loaded and the store could not be read.
    #[instrument(skip(self, filters), fields(filters = filters.len()))]
    pub async fn get_player_info(
        &self,
        player_id: PlayerId,
        kind: StatKind,
        filters: &[RowRequirement],
    ) -> StatzResult<PlayerInfo> {
        let entry = match self.cache.lookup(player_id, kind) {
            Some(entry) => entry,
            None => {
                debug!("Cache miss, loading from store");
                self.cache.load(player_id, kind).await?
            }
        };
        Ok(PlayerInfo::from_entry(player_id, kind, &entry, filters))
    }

    /// Cache-only read. Never touches the store; stale entries are served
    /// as they are and missing ones return `None`.
    pub fn cached_player_info(
        &self,
        player_id: PlayerId,
        kind: StatKind,
        filters: &[RowRequirement],
    ) -> Option<PlayerInfo> {
        self.cache
            .get(player_id, kind)
            .map(|entry| PlayerInfo::from_entry(player_id, kind, &entry, filters))
    }

    pub async fn total(&self, player_id: PlayerId, kind: StatKind, filters: &[RowRequirement]) -> StatzResult<f64> {
        Ok(self.get_player_info(player_id, kind, filters).await?.total_value())
    }

    /// Queues an update. Nothing is written until the next flush.
    ///
    /// # Returns
    ///
    /// Whether the update started a new pending entry, was merged into one,
    /// or was ignored because the kind is disabled or the service has shut
    /// down.
    ///
    /// # Errors
    ///
    /// [`StatzError::InvalidStatisticKind`](crate::StatzError::InvalidStatisticKind)
    /// for an unregistered kind and
    /// [`StatzError::SchemaViolation`](crate::StatzError::SchemaViolation)
    /// when the dimensions or value type do not match the kind.
    pub fn set_player_info(
        &self,
        player_id: PlayerId,
        kind: StatKind,
        dimensions: Dimensions,
        value: impl Into<StatValue>,
    ) -> StatzResult<Enqueued> {
        self.queue.enqueue(player_id, kind, dimensions, value)
    }

    /// Flushes right away, waiting for any running flush first.
    ///
    /// Cancelling the returned future does not cancel the flush; it keeps
    /// running in the background.
    ///
    /// # Errors
    ///
    /// [`StatzError::UnpersistedRecords`](crate::StatzError::UnpersistedRecords)
    /// when some updates could not be written. They are requeued for the
    /// next flush or, past the retry limit, dropped.
    pub async fn flush_now(&self) -> StatzResult<FlushReport> {
        self.scheduler.flush(FlushMode::Forced).await
    }

    /// Drops a player's cached rows, e.g. when they leave.
    pub fn evict_player(&self, player_id: PlayerId) {
        self.cache.evict_player(player_id);
    }
}
