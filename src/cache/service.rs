//! Published snapshot service: the facade readers and editors hold.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::repos::VersionStore;

use super::codec::{CompressionPolicy, PropertyCodec};
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::EventQueue;
use super::published::PublishedContentFactory;
use super::refresh::{CacheRefreshEngine, RebuildReport};
use super::snapshot::{PreviewContext, Snapshot};
use super::store::SnapshotStore;
use super::trigger::CacheTrigger;

/// Wires the snapshot store, refresh engine, and trigger around one content store.
pub struct PublishedSnapshotService {
    store: Arc<SnapshotStore>,
    factory: Arc<PublishedContentFactory>,
    engine: Arc<CacheRefreshEngine>,
    trigger: Arc<CacheTrigger>,
}

impl PublishedSnapshotService {
    /// Build an empty cache over `source`. Call [`rebuild_all`](Self::rebuild_all) to load it.
    pub fn new(config: CacheConfig, source: Arc<dyn VersionStore>) -> Self {
        let codec = PropertyCodec::new(CompressionPolicy::from_config(&config));
        let store = Arc::new(SnapshotStore::new());
        let queue = Arc::new(EventQueue::new());
        let engine = Arc::new(CacheRefreshEngine::new(
            config,
            Arc::clone(&store),
            queue,
            source,
            codec.clone(),
        ));
        let trigger = Arc::new(CacheTrigger::new(Arc::clone(&engine)));

        Self {
            store,
            factory: Arc::new(PublishedContentFactory::new(codec)),
            engine,
            trigger,
        }
    }

    /// Pin the current generation for reading.
    pub fn create_snapshot(&self, context: PreviewContext) -> Snapshot {
        let lease = self.store.lease();
        let graph = self.store.graph();
        debug!(generation = graph.generation(), preview = context.preview, "Snapshot created");
        Snapshot::new(graph, Arc::clone(&self.factory), context, lease)
    }

    pub fn published_snapshot(&self) -> Snapshot {
        self.create_snapshot(PreviewContext::published())
    }

    pub async fn rebuild_all(&self) -> Result<RebuildReport, CacheError> {
        self.engine.rebuild_all().await
    }

    pub fn trigger(&self) -> &Arc<CacheTrigger> {
        &self.trigger
    }

    pub fn engine(&self) -> &Arc<CacheRefreshEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn generation(&self) -> u64 {
        self.store.generation()
    }

    pub fn live_snapshots(&self) -> usize {
        self.store.live_snapshots()
    }

    /// Consume the queue in the background, on every publish and on each interval tick.
    ///
    /// After a failed round the task waits for the next tick before retrying.
    pub fn spawn_auto_consume(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let period = engine.config().auto_consume_interval();
        info!(interval_ms = period.as_millis() as u64, "Auto-consume started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            let mut backoff = false;
            loop {
                if backoff {
                    interval.tick().await;
                } else {
                    tokio::select! {
                        _ = engine.queue().notified() => {}
                        _ = interval.tick() => {}
                    }
                }

                backoff = match engine.consume().await {
                    Ok(_) => false,
                    Err(err) => {
                        warn!(error = %err, "Background cache refresh failed; retrying next tick");
                        true
                    }
                };
            }
        })
    }
}
