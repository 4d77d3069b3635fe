//! Statz - write-behind player statistics
//!
//! Gameplay events are turned into small statistic updates that land in an
//! in-memory queue instead of the database. The queue coalesces updates for
//! the same row, a scheduler flushes it in batches, and reads go through a
//! cache of persisted rows:
//!
//! - [`UpdateQueue`] - coalescing pending set, safe for many producers
//! - [`FlushScheduler`] - periodic, forced and final batched flushes
//! - [`CachingManager`] - per (player, kind) snapshot of persisted rows
//! - [`StatzApi`] - read/write facade for commands and reporting
//! - [`RowStore`] - pluggable durable storage (SQLite or in-memory)
//!
//! ```no_run
//! use std::sync::Arc;
//! use statz_core::{Dimensions, MemoryRowStore, PlayerId, StatKind, StatzConfig, StatzService};
//!
//! # async fn run() -> statz_core::StatzResult<()> {
//! let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new()))?;
//! let flusher = service.start();
//! let api = service.api();
//!
//! let player = PlayerId::new();
//! api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0)?;
//! api.flush_now().await?;
//! assert_eq!(api.total(player, StatKind::Joins, &[]).await?, 1.0);
//!
//! flusher.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod flush;
pub mod query;
pub mod queue;
pub mod schema;
pub mod service;
pub mod store;
pub mod types;

pub use cache::{CacheEntry, CacheStats, CachingManager, RefreshMode};
pub use config::StatzConfig;
pub use error::{StatzError, StatzResult, StoreError, StoreResult};
pub use flush::{FlushMode, FlushReport, FlushScheduler, FlushSettings, FlushStats, FlushTaskHandle};
pub use query::{PlayerInfo, RowRequirement, StatzApi};
pub use queue::{Enqueued, FlushBatch, PendingUpdate, QueueStats, UpdateQueue};
pub use schema::{MergePolicy, SchemaRegistry, StatSchema};
pub use service::{ServiceStats, StatzService};
pub use store::{BatchWriteOutcome, FailedRecord, MemoryRowStore, RowStore, SqliteRowStore};
pub use types::{dimensions, Dimensions, PlayerId, StatKind, StatRecord, StatValue, UpdateKey, ValueType};
