//! In-memory update queue with coalescing.
//!
//! Producers call [`UpdateQueue::enqueue`] from any thread. The lock is held
//! only while a single entry is merged, while the pending map is swapped out
//! by [`UpdateQueue::drain`], or while failed updates are merged back by
//! [`UpdateQueue::requeue`]. No I/O ever happens under it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::StatzResult;
use crate::schema::SchemaRegistry;
use crate::types::{current_timestamp_millis, Dimensions, PlayerId, StatKind, StatRecord, StatValue, UpdateKey};

/// A record waiting to be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub record: StatRecord,
    /// Queue position; lower values flush first.
    pub seq: u64,
    /// Number of failed persistence attempts so far.
    pub retries: u32,
}

/// What happened to an enqueued update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new pending entry was created.
    Inserted,
    /// The update was merged into an existing pending entry.
    Coalesced,
    /// The kind is disabled or the queue is closed; nothing was recorded.
    Ignored,
}

/// Immutable snapshot of the queue taken by a flush, ordered by `seq`.
#[derive(Debug)]
pub struct FlushBatch {
    updates: Vec<PendingUpdate>,
    taken_at: SystemTime,
}

impl FlushBatch {
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    /// Splits the batch into one group per kind, preserving queue order.
    pub fn into_groups(self) -> BTreeMap<StatKind, Vec<PendingUpdate>> {
        let mut groups: BTreeMap<StatKind, Vec<PendingUpdate>> = BTreeMap::new();
        for update in self.updates {
            groups.entry(update.record.kind).or_default().push(update);
        }
        groups
    }
}

#[derive(Debug, Default)]
struct PendingSet {
    entries: HashMap<UpdateKey, PendingUpdate>,
    next_seq: u64,
}

/// Counters describing queue activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub enqueued: u64,
    pub coalesced: u64,
    pub ignored: u64,
    pub requeued: u64,
}

/// The pending set of not-yet-flushed updates.
pub struct UpdateQueue {
    registry: Arc<SchemaRegistry>,
    pending: Mutex<PendingSet>,
    closed: AtomicBool,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    ignored: AtomicU64,
    requeued: AtomicU64,
}

impl UpdateQueue {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(PendingSet::default()),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    /// Adds an update, merging it with any pending entry for the same key.
    ///
    /// Fails only when the kind is not registered or the update does not
    /// match the kind's schema; both are caller bugs.
    pub fn enqueue(
        &self,
        player_id: PlayerId,
        kind: StatKind,
        dimensions: Dimensions,
        value: impl Into<StatValue>,
    ) -> StatzResult<Enqueued> {
        let value = value.into();
        let schema = self.registry.schema(kind)?;
        schema.validate(&dimensions, &value)?;

        if !schema.enabled {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(Enqueued::Ignored);
        }
        let record = StatRecord {
            player_id,
            kind,
            dimensions,
            value,
            timestamp: current_timestamp_millis(),
        };
        let key = record.key();
        let merge = schema.merge;

        let outcome = {
            let mut guard = self.pending.lock();
            // Checked under the lock so nothing slips in after the final drain.
            if self.closed.load(Ordering::Acquire) {
                drop(guard);
                warn!("Update for {} ({}) arrived after shutdown, ignoring", player_id, kind);
                self.ignored.fetch_add(1, Ordering::Relaxed);
                return Ok(Enqueued::Ignored);
            }
            let pending = &mut *guard;
            match pending.entries.get_mut(&key) {
                Some(existing) => {
                    existing.record.value = merge.merge(&existing.record.value, record.value);
                    existing.record.timestamp = record.timestamp;
                    // Fresh data gets its own full set of attempts.
                    existing.retries = 0;
                    Enqueued::Coalesced
                }
                None => {
                    let seq = pending.next_seq;
                    pending.next_seq += 1;
                    pending.entries.insert(
                        key,
                        PendingUpdate {
                            record,
                            seq,
                            retries: 0,
                        },
                    );
                    Enqueued::Inserted
                }
            }
        };

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if outcome == Enqueued::Coalesced {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Swaps out the pending set and returns it as a batch.
    pub fn drain(&self) -> FlushBatch {
        let entries = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut pending.entries)
        };

        let mut updates: Vec<PendingUpdate> = entries.into_values().collect();
        updates.sort_unstable_by_key(|u| u.seq);
        FlushBatch {
            updates,
            taken_at: SystemTime::now(),
        }
    }

    /// Puts failed updates back at the front of the queue.
    ///
    /// Requeued updates keep their original sequence numbers, which are
    /// older than anything enqueued since the drain. If a newer update for
    /// the same key is already pending, the failed value is merged in first
    /// and the merged entry keeps the newer update's retry count, so a
    /// never-attempted update is not dropped on behalf of an old one.
    pub fn requeue(&self, failed: Vec<PendingUpdate>) {
        if failed.is_empty() {
            return;
        }
        let count = failed.len() as u64;

        let mut guard = self.pending.lock();
        let pending = &mut *guard;
        for update in failed {
            let key = update.record.key();
            let merge = match self.registry.schema(update.record.kind) {
                Ok(schema) => schema.merge,
                Err(_) => continue,
            };
            match pending.entries.get_mut(&key) {
                Some(newer) => {
                    let newer_value = newer.record.value.clone();
                    newer.record.value = merge.merge(&update.record.value, newer_value);
                    newer.seq = update.seq;
                    newer.retries = newer.retries.min(update.retries);
                }
                None => {
                    pending.entries.insert(key, update);
                }
            }
        }
        drop(guard);

        self.requeued.fetch_add(count, Ordering::Relaxed);
        debug!("Requeued {} failed updates", count);
    }

    /// Stops accepting updates. Later enqueues are ignored.
    pub fn close(&self) {
        let _pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the pending entry for a key, if any.
    pub fn peek(&self, key: &UpdateKey) -> Option<PendingUpdate> {
        self.pending.lock().entries.get(key).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}
