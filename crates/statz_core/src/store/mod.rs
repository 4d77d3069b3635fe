//! Durable row storage.
//!
//! A row store keeps one logical table per statistic kind and one row per
//! (player, dimensions) key. Writes arrive grouped by kind and are applied
//! as upserts that honour the kind's merge policy, so the stored value is
//! always the accumulated statistic.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schema::StatSchema;
use crate::types::{PlayerId, StatKind, StatRecord};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRowStore;
pub use sqlite::SqliteRowStore;

/// A record the store could not persist.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub record: StatRecord,
    pub reason: String,
}

/// Result of a grouped write that was at least partially attempted.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    pub written: usize,
    pub failed: Vec<FailedRecord>,
}

impl BatchWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Backing store for statistic rows.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Persists a group of records of the same kind.
    ///
    /// `Ok` may still carry per-record failures; `Err` means nothing in the
    /// group was written.
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError>;

    /// Loads every row of `kind` belonging to `player_id`.
    async fn read_all(
        &self,
        player_id: PlayerId,
        kind: StatKind,
    ) -> Result<Vec<StatRecord>, StoreError>;
}
