//! Wiring of the queue, cache, scheduler and query API.

use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStats, CachingManager};
use crate::config::StatzConfig;
use crate::error::StatzResult;
use crate::flush::{FlushScheduler, FlushStats, FlushTaskHandle};
use crate::query::StatzApi;
use crate::queue::{QueueStats, UpdateQueue};
use crate::schema::SchemaRegistry;
use crate::store::RowStore;

/// Combined counters of every component.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub flush: FlushStats,
}

/// Owns one instance of each component and hands out shared handles.
pub struct StatzService {
    registry: Arc<SchemaRegistry>,
    queue: Arc<UpdateQueue>,
    cache: Arc<CachingManager>,
    scheduler: Arc<FlushScheduler>,
    api: StatzApi,
}

impl StatzService {
    pub fn new(config: &StatzConfig, store: Arc<dyn RowStore>) -> StatzResult<Self> {
        config.validate()?;
        let registry = Arc::new(config.build_registry()?);
        let queue = Arc::new(UpdateQueue::new(registry.clone()));
        let cache = Arc::new(CachingManager::new(store.clone(), config.cache_refresh));
        let scheduler = Arc::new(FlushScheduler::new(
            queue.clone(),
            store,
            cache.clone(),
            registry.clone(),
            config.flush_settings(),
        ));
        let api = StatzApi::new(queue.clone(), cache.clone(), scheduler.clone());

        info!(
            "Statistics service ready ({} kinds, flush every {:?}, {:?} cache refresh)",
            registry.schemas().len(),
            config.flush_interval,
            config.cache_refresh
        );

        Ok(Self {
            registry,
            queue,
            cache,
            scheduler,
            api,
        })
    }

    pub fn api(&self) -> StatzApi {
        self.api.clone()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<UpdateQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CachingManager> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<FlushScheduler> {
        &self.scheduler
    }

    /// Starts periodic flushing. Call [`FlushTaskHandle::shutdown`] on the
    /// returned handle to stop and run the final flush.
    pub fn start(&self) -> FlushTaskHandle {
        self.scheduler.start()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            queue: self.queue.stats(),
            cache: self.cache.stats(),
            flush: self.scheduler.stats(),
        }
    }
}
