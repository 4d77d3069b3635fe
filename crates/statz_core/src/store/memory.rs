//! In-memory row store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{BatchWriteOutcome, RowStore};
use crate::error::StoreError;
use crate::schema::StatSchema;
use crate::types::{Dimensions, PlayerId, StatKind, StatRecord};

/// Row store backed by a concurrent map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    rows: DashMap<(PlayerId, StatKind), Vec<StatRecord>>,
    write_calls: AtomicU64,
    rows_written: AtomicU64,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_batch` calls received.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Number of individual rows upserted.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Synchronous lookup of a single row, mainly for inspection.
    pub fn row(&self, player_id: PlayerId, kind: StatKind, dimensions: &Dimensions) -> Option<StatRecord> {
        self.rows
            .get(&(player_id, kind))?
            .iter()
            .find(|r| &r.dimensions == dimensions)
            .cloned()
    }

    fn upsert(&self, schema: &StatSchema, record: StatRecord) {
        let mut rows = self.rows.entry((record.player_id, record.kind)).or_default();
        match rows.iter().position(|r| r.dimensions == record.dimensions) {
            Some(index) => {
                let existing = &mut rows[index];
                existing.value = schema.merge.merge(&existing.value, record.value);
                existing.timestamp = record.timestamp;
            }
            None => rows.push(record),
        }
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let written = records.len();
        for record in records {
            self.upsert(schema, record);
        }
        self.rows_written.fetch_add(written as u64, Ordering::Relaxed);
        Ok(BatchWriteOutcome {
            written,
            failed: Vec::new(),
        })
    }

    async fn read_all(
        &self,
        player_id: PlayerId,
        kind: StatKind,
    ) -> Result<Vec<StatRecord>, StoreError> {
        Ok(self
            .rows
            .get(&(player_id, kind))
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }
}
