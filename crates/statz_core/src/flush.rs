//! Periodic flushing of the update queue into the row store.
//!
//! A single [`FlushScheduler::flush`] operation serves three modes:
//!
//! * [`FlushMode::Periodic`] - fired by the background ticker; skipped when
//!   another flush is still running.
//! * [`FlushMode::Forced`] - requested by a caller; waits for any running
//!   flush, then runs and reports unpersisted records as an error.
//! * [`FlushMode::Final`] - run exactly once at shutdown; waits for any
//!   running flush, closes the queue, and treats failures as data loss.
//!
//! Failed records are requeued at the front of the queue with their retry
//! counter incremented, and dropped once the counter exceeds the limit.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::CachingManager;
use crate::error::{StatzError, StatzResult};
use crate::queue::{PendingUpdate, UpdateQueue};
use crate::schema::SchemaRegistry;
use crate::store::RowStore;
use crate::types::{PlayerId, StatKind, UpdateKey};

/// Which flavour of flush is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    Periodic,
    Forced,
    Final,
}

/// What a single flush did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub mode: FlushMode,
    /// True when a periodic tick found another flush in flight.
    pub skipped: bool,
    pub drained: usize,
    pub persisted: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub kinds: usize,
    pub elapsed_ms: u64,
}

impl FlushReport {
    fn new(mode: FlushMode) -> Self {
        Self {
            mode,
            skipped: false,
            drained: 0,
            persisted: 0,
            requeued: 0,
            dropped: 0,
            kinds: 0,
            elapsed_ms: 0,
        }
    }

    pub fn unpersisted(&self) -> usize {
        self.requeued + self.dropped
    }
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub flushes: u64,
    pub skipped_ticks: u64,
    pub final_flushes: u64,
    pub in_flight: usize,
    /// Highest number of flushes ever observed running at once.
    pub max_in_flight: usize,
    pub records_persisted: u64,
    pub records_requeued: u64,
    pub records_dropped: u64,
}

#[derive(Debug, Default)]
struct FlushMetrics {
    flushes: AtomicU64,
    skipped_ticks: AtomicU64,
    final_flushes: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    records_persisted: AtomicU64,
    records_requeued: AtomicU64,
    records_dropped: AtomicU64,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub interval: Duration,
    /// Failed attempts tolerated before a record is dropped.
    pub max_retries: u32,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

pub struct FlushScheduler {
    queue: Arc<UpdateQueue>,
    store: Arc<dyn RowStore>,
    cache: Arc<CachingManager>,
    registry: Arc<SchemaRegistry>,
    settings: FlushSettings,
    flush_lock: Mutex<()>,
    metrics: FlushMetrics,
}

impl FlushScheduler {
    pub fn new(
        queue: Arc<UpdateQueue>,
        store: Arc<dyn RowStore>,
        cache: Arc<CachingManager>,
        registry: Arc<SchemaRegistry>,
        settings: FlushSettings,
    ) -> Self {
        Self {
            queue,
            store,
            cache,
            registry,
            settings,
            flush_lock: Mutex::new(()),
            metrics: FlushMetrics::default(),
        }
    }

    pub fn settings(&self) -> &FlushSettings {
        &self.settings
    }

    /// Drains the queue and persists it.
    ///
    /// The flush runs on its own task. Dropping the returned future (for
    /// example when a caller wraps it in `tokio::time::timeout`) does not
    /// interrupt it: the drained batch is still written, requeued or
    /// reported as lost, and the scheduler's counters stay consistent.
    ///
    /// # Returns
    ///
    /// * Periodic flushes always return `Ok`; persistence problems are
    ///   logged and retried. A tick that finds another flush running
    ///   returns a report with `skipped` set.
    /// * Forced and final flushes return [`StatzError::UnpersistedRecords`]
    ///   when anything was left behind.
    ///
    /// # Errors
    ///
    /// [`StatzError::FlushTask`] if the flush task panicked.
    pub async fn flush(self: &Arc<Self>, mode: FlushMode) -> StatzResult<FlushReport> {
        let scheduler = Arc::clone(self);
        match tokio::spawn(async move { scheduler.flush_exclusive(mode).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!("{:?} flush task failed: {}", mode, e);
                Err(StatzError::flush_task(e.to_string()))
            }
        }
    }

    async fn flush_exclusive(&self, mode: FlushMode) -> StatzResult<FlushReport> {
        let _guard = match mode {
            FlushMode::Periodic => match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.metrics.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    debug!("Flush still in flight, skipping tick");
                    let mut report = FlushReport::new(mode);
                    report.skipped = true;
                    return Ok(report);
                }
            },
            FlushMode::Forced | FlushMode::Final => self.flush_lock.lock().await,
        };

        if mode == FlushMode::Periodic && self.queue.is_closed() {
            let mut report = FlushReport::new(mode);
            report.skipped = true;
            return Ok(report);
        }
        if mode == FlushMode::Final {
            self.queue.close();
        }

        let running = self.metrics.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let report = self.run_cycle(mode).await;

        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        if mode == FlushMode::Final {
            self.metrics.final_flushes.fetch_add(1, Ordering::Relaxed);
        }

        if mode != FlushMode::Periodic && report.unpersisted() > 0 {
            return Err(StatzError::UnpersistedRecords {
                requeued: report.requeued,
                dropped: report.dropped,
            });
        }
        Ok(report)
    }

    async fn run_cycle(&self, mode: FlushMode) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport::new(mode);

        let batch = self.queue.drain();
        report.drained = batch.len();
        if batch.is_empty() {
            debug!("Nothing to flush ({:?})", mode);
            return report;
        }

        let groups = batch.into_groups();
        report.kinds = groups.len();
        let mut to_requeue = Vec::new();
        let mut touched: HashSet<(PlayerId, StatKind)> = HashSet::new();

        for (kind, updates) in groups {
            let schema = match self.registry.schema(kind) {
                Ok(schema) => schema,
                Err(e) => {
                    error!("Dropping {} updates: {}", updates.len(), e);
                    report.dropped += updates.len();
                    continue;
                }
            };

            let records = updates.iter().map(|u| u.record.clone()).collect();
            let failures: HashMap<UpdateKey, String> = match self.store.write_batch(schema, records).await {
                Ok(outcome) => outcome
                    .failed
                    .into_iter()
                    .map(|f| (f.record.key(), f.reason))
                    .collect(),
                Err(e) => {
                    warn!("Writing {} {} rows failed: {}", updates.len(), kind, e);
                    let reason = e.to_string();
                    updates
                        .iter()
                        .map(|u| (u.record.key(), reason.clone()))
                        .collect()
                }
            };

            for update in updates {
                match failures.get(&update.record.key()) {
                    None => {
                        report.persisted += 1;
                        touched.insert((update.record.player_id, kind));
                    }
                    Some(reason) => {
                        if let Some(retry) = self.handle_failure(update, reason, mode) {
                            to_requeue.push(retry);
                            report.requeued += 1;
                        } else {
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        self.queue.requeue(to_requeue);

        join_all(
            touched
                .iter()
                .map(|(player_id, kind)| self.cache.on_flushed(*player_id, *kind)),
        )
        .await;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .records_persisted
            .fetch_add(report.persisted as u64, Ordering::Relaxed);
        self.metrics
            .records_requeued
            .fetch_add(report.requeued as u64, Ordering::Relaxed);
        self.metrics
            .records_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        debug!(
            "Flushed {} of {} updates across {} kinds in {}ms ({} requeued, {} dropped)",
            report.persisted, report.drained, report.kinds, report.elapsed_ms, report.requeued, report.dropped
        );
        report
    }

    /// Decides whether a failed update gets another attempt.
    fn handle_failure(&self, mut update: PendingUpdate, reason: &str, mode: FlushMode) -> Option<PendingUpdate> {
        update.retries += 1;
        let record = &update.record;

        if mode == FlushMode::Final {
            error!(
                "Data loss: {} {:?} for {} = {} not persisted at shutdown: {}",
                record.kind, record.dimensions, record.player_id, record.value, reason
            );
            return None;
        }
        if update.retries > self.settings.max_retries {
            error!(
                "Data loss: {} {:?} for {} = {} dropped after {} attempts: {}",
                record.kind, record.dimensions, record.player_id, record.value, update.retries, reason
            );
            return None;
        }

        warn!(
            "Requeuing {} for {} (attempt {} failed): {}",
            record.kind, record.player_id, update.retries, reason
        );
        Some(update)
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.metrics.flushes.load(Ordering::Relaxed),
            skipped_ticks: self.metrics.skipped_ticks.load(Ordering::Relaxed),
            final_flushes: self.metrics.final_flushes.load(Ordering::Relaxed),
            in_flight: self.metrics.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.metrics.max_in_flight.load(Ordering::SeqCst),
            records_persisted: self.metrics.records_persisted.load(Ordering::Relaxed),
            records_requeued: self.metrics.records_requeued.load(Ordering::Relaxed),
            records_dropped: self.metrics.records_dropped.load(Ordering::Relaxed),
        }
    }

    /// Starts the background ticker.
    ///
    /// Each tick spawns a periodic flush so the ticker keeps its cadence
    /// even when a flush runs long; overlapping ticks are skipped by the
    /// flush lock.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Returns
    ///
    /// A [`FlushTaskHandle`]. Call [`FlushTaskHandle::shutdown`] on it to
    /// stop the ticker and run the final flush; dropping the handle leaves
    /// the ticker running and skips the final flush.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use statz_core::{MemoryRowStore, StatzConfig, StatzService};
    /// # async fn example() -> statz_core::StatzResult<()> {
    /// let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new()))?;
    /// let flusher = service.scheduler().start();
    /// // ... record statistics ...
    /// let report = flusher.shutdown().await?;
    /// println!("final flush wrote {} updates", report.persisted);
    /// # Ok(())
    /// # }
    /// ```
    pub fn start(self: &Arc<Self>) -> FlushTaskHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let scheduler = Arc::clone(self);
        let period = self.settings.interval;

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            let mut flushes = JoinSet::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scheduler = scheduler.clone();
                        flushes.spawn(async move {
                            if let Err(e) = scheduler.flush(FlushMode::Periodic).await {
                                error!("Periodic flush failed: {}", e);
                            }
                        });
                        while flushes.try_join_next().is_some() {}
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            while flushes.join_next().await.is_some() {}
            debug!("Flush ticker stopped");
        });

        info!("Flush scheduler started (interval: {:?})", period);
        FlushTaskHandle {
            scheduler: Arc::clone(self),
            shutdown_tx,
            join,
        }
    }
}

/// Handle to a running flush ticker.
pub struct FlushTaskHandle {
    scheduler: Arc<FlushScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl FlushTaskHandle {
    /// Stops the ticker, lets in-flight flushes finish, then runs the final
    /// flush exactly once.
    pub async fn shutdown(self) -> StatzResult<FlushReport> {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join.await {
            error!("Flush ticker terminated abnormally: {}", e);
        }

        info!("Running final flush");
        let result = self.scheduler.flush(FlushMode::Final).await;
        match &result {
            Ok(report) => info!(
                "Final flush persisted {} updates across {} kinds",
                report.persisted, report.kinds
            ),
            Err(e) => error!("Final flush incomplete: {}", e),
        }
        result
    }
}
