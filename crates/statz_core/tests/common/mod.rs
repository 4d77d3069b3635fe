//! Row store doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use statz_core::{
    BatchWriteOutcome, FailedRecord, MemoryRowStore, PlayerId, RowStore, StatKind, StatRecord,
    StatSchema, StatzConfig, StoreError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Config with a short flush interval so ticker-driven tests stay fast.
pub fn fast_config(max_retries: u32) -> StatzConfig {
    StatzConfig {
        flush_interval: Duration::from_millis(10),
        max_retries,
        ..Default::default()
    }
}

/// Rejects every record of the next `failures` write calls.
pub struct FlakyStore {
    pub inner: MemoryRowStore,
    failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryRowStore::new(),
            failures: AtomicU32::new(failures),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }
}

#[async_trait]
impl RowStore for FlakyStore {
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(BatchWriteOutcome {
                written: 0,
                failed: records
                    .into_iter()
                    .map(|record| FailedRecord {
                        record,
                        reason: "database is locked".to_string(),
                    })
                    .collect(),
            });
        }
        self.inner.write_batch(schema, records).await
    }

    async fn read_all(&self, player_id: PlayerId, kind: StatKind) -> Result<Vec<StatRecord>, StoreError> {
        self.inner.read_all(player_id, kind).await
    }
}

/// Sleeps before every write, to keep a flush in flight.
pub struct SlowStore {
    pub inner: MemoryRowStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryRowStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl RowStore for SlowStore {
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.write_batch(schema, records).await
    }

    async fn read_all(&self, player_id: PlayerId, kind: StatKind) -> Result<Vec<StatRecord>, StoreError> {
        self.inner.read_all(player_id, kind).await
    }
}

/// Store whose reads can be paused after fetching rows, to line a cache
/// load up against a concurrent flush.
pub struct GatedStore {
    pub inner: MemoryRowStore,
    hold_reads: AtomicBool,
    pub read_entered: Notify,
    pub release: Notify,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryRowStore::new(),
            hold_reads: AtomicBool::new(false),
            read_entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn hold_reads(&self, hold: bool) {
        self.hold_reads.store(hold, Ordering::SeqCst);
    }
}

#[async_trait]
impl RowStore for GatedStore {
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        self.inner.write_batch(schema, records).await
    }

    async fn read_all(&self, player_id: PlayerId, kind: StatKind) -> Result<Vec<StatRecord>, StoreError> {
        let rows = self.inner.read_all(player_id, kind).await?;
        if self.hold_reads.load(Ordering::SeqCst) {
            self.read_entered.notify_one();
            self.release.notified().await;
        }
        Ok(rows)
    }
}
