//! Cache refresh engine.
//!
//! Drains change events, re-reads the affected nodes from the content store,
//! and publishes the result as one new graph generation per batch. Owns the
//! full rebuild.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tracing::{info, instrument, warn};

use crate::application::repos::VersionStore;
use crate::domain::entities::{ContentNode, ContentNodeKit};
use crate::domain::path::NodePath;
use crate::domain::types::{
    ChangeKind, NodeId, RECYCLE_BIN_CONTENT_ID, RECYCLE_BIN_MEDIA_ID, ROOT_ID, is_reserved_root,
};

use super::codec::PropertyCodec;
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{ChangeTarget, EventQueue};
use super::graph::GraphBuilder;
use super::lock::mutex_lock;
use super::planner::{PlannedRefresh, RefreshAction, RefreshPlan};
use super::store::{GraphWriter, SnapshotStore};

const SOURCE: &str = "cache::refresh";
const METRIC_REFRESH_MS: &str = "nucache_refresh_ms";
const METRIC_REBUILD_MS: &str = "nucache_rebuild_ms";
const METRIC_REFRESH_DEFERRED: &str = "nucache_refresh_deferred_total";
const METRIC_REBUILD_TOTAL: &str = "nucache_rebuild_total";

type SharedRebuild = Shared<BoxFuture<'static, Result<RebuildReport, CacheError>>>;

/// Outcome of a full rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub generation: u64,
    pub loaded: usize,
    /// Nodes left out: no version data, unresolvable parent, or undecodable.
    pub skipped: usize,
    pub repaired_paths: usize,
    pub elapsed_ms: u64,
}

/// Outcome of one consumption round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub events: usize,
    /// Nodes written into the new generation.
    pub applied: usize,
    /// Nodes tombstoned.
    pub removed: usize,
    /// Steps left untouched because fresh data could not be read.
    pub deferred: usize,
    pub rebuild: Option<RebuildReport>,
    pub generation: u64,
}

enum StepOutcome {
    Applied(usize),
    Removed(usize),
    Deferred,
}

/// Translates change notifications into snapshot store updates.
pub struct CacheRefreshEngine {
    config: CacheConfig,
    store: Arc<SnapshotStore>,
    queue: Arc<EventQueue>,
    source: Arc<dyn VersionStore>,
    codec: PropertyCodec,
    rebuild: Mutex<Option<SharedRebuild>>,
}

impl CacheRefreshEngine {
    pub fn new(
        config: CacheConfig,
        store: Arc<SnapshotStore>,
        queue: Arc<EventQueue>,
        source: Arc<dyn VersionStore>,
        codec: PropertyCodec,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            source,
            codec,
            rebuild: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Record a node change and apply it now.
    pub async fn on_node_changed(
        self: &Arc<Self>,
        node_id: NodeId,
        change: ChangeKind,
    ) -> Result<ConsumeReport, CacheError> {
        self.queue.publish(ChangeTarget::node(node_id, change));
        self.consume().await
    }

    /// Record a change covering a whole branch and apply it now.
    pub async fn on_branch_changed(
        self: &Arc<Self>,
        root_id: NodeId,
        change: ChangeKind,
    ) -> Result<ConsumeReport, CacheError> {
        self.queue.publish(ChangeTarget::branch(root_id, change));
        self.consume().await
    }

    /// Apply pending events until the queue is empty.
    ///
    /// Batches are drained while holding the store writer, so batches apply in
    /// queue order. Store outages defer the affected steps and keep their
    /// cached state; an inconsistent result discards the batch and rebuilds.
    #[instrument(skip(self))]
    pub async fn consume(self: &Arc<Self>) -> Result<ConsumeReport, CacheError> {
        let mut total = ConsumeReport {
            generation: self.store.generation(),
            ..ConsumeReport::default()
        };

        loop {
            let started_at = Instant::now();
            let mut writer = self.store.write().await;
            let events = self.queue.drain(self.config.batch_limit());
            if events.is_empty() {
                return Ok(total);
            }

            let plan = RefreshPlan::from_events(events);
            total.events += plan.event_count;
            info!(plan = %plan, "Cache refresh starting");

            if plan.rebuild_all {
                drop(writer);
                self.rebuild_for_consume(&mut total).await?;
                continue;
            }

            match self.execute(&mut writer, &plan.steps, &mut total).await {
                Ok(()) => {
                    total.generation = writer.commit();
                    let elapsed_ms = started_at.elapsed().as_millis() as u64;
                    histogram!(METRIC_REFRESH_MS).record(elapsed_ms as f64);
                    info!(
                        generation = total.generation,
                        applied = total.applied,
                        removed = total.removed,
                        deferred = total.deferred,
                        elapsed_ms,
                        "Cache refresh complete"
                    );
                }
                Err(err) if err.requires_rebuild() => {
                    drop(writer);
                    warn!(error = %err, "Incremental refresh inconsistent; rebuilding");
                    self.rebuild_for_consume(&mut total).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A failed rebuild re-queues itself so the next round retries it.
    async fn rebuild_for_consume(self: &Arc<Self>, total: &mut ConsumeReport) -> Result<(), CacheError> {
        match self.rebuild_all().await {
            Ok(report) => {
                total.generation = report.generation;
                total.rebuild = Some(report);
                Ok(())
            }
            Err(err) => {
                self.queue.publish(ChangeTarget::All);
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        writer: &mut GraphWriter<'_>,
        steps: &[PlannedRefresh],
        report: &mut ConsumeReport,
    ) -> Result<(), CacheError> {
        for step in steps {
            let outcome = match step.action {
                RefreshAction::Remove => {
                    let removed = writer.clear_branch(step.node_id);
                    info!(node_id = step.node_id, count = removed.len(), "Removed cached branch");
                    StepOutcome::Removed(removed.len())
                }
                RefreshAction::Node | RefreshAction::Branch if is_reserved_root(step.node_id) => {
                    self.refresh_below_reserved(writer, step.node_id).await?
                }
                RefreshAction::Node => self.refresh_node(writer, step.node_id).await?,
                RefreshAction::Branch => self.refresh_branch(writer, step.node_id).await?,
            };

            match outcome {
                StepOutcome::Applied(count) => report.applied += count,
                StepOutcome::Removed(count) => report.removed += count,
                StepOutcome::Deferred => {
                    report.deferred += 1;
                    counter!(METRIC_REFRESH_DEFERRED).increment(1);
                }
            }
        }
        Ok(())
    }

    async fn refresh_node(
        &self,
        writer: &mut GraphWriter<'_>,
        node_id: NodeId,
    ) -> Result<StepOutcome, CacheError> {
        let kit = match self.source.fetch_node(node_id).await {
            Ok(Some(kit)) => kit,
            Ok(None) => {
                warn!(node_id, "Changed node vanished before refresh; keeping cached state");
                return Ok(StepOutcome::Deferred);
            }
            Err(err) => {
                warn!(node_id, error = %err, "Content store unavailable; keeping cached state");
                return Ok(StepOutcome::Deferred);
            }
        };

        let Some(node) = self.build_node(&kit) else {
            return Ok(StepOutcome::Deferred);
        };
        writer.set(node)?;
        Ok(StepOutcome::Applied(1))
    }

    async fn refresh_branch(
        &self,
        writer: &mut GraphWriter<'_>,
        root_id: NodeId,
    ) -> Result<StepOutcome, CacheError> {
        let kits = match self.source.fetch_branch(root_id).await {
            Ok(kits) if kits.is_empty() => {
                warn!(node_id = root_id, "Changed branch vanished before refresh; keeping cached state");
                return Ok(StepOutcome::Deferred);
            }
            Ok(kits) => kits,
            Err(err) => {
                warn!(node_id = root_id, error = %err, "Content store unavailable; keeping cached branch");
                return Ok(StepOutcome::Deferred);
            }
        };

        let nodes: Vec<ContentNode> = kits.iter().filter_map(|kit| self.build_node(kit)).collect();
        let count = nodes.len();
        writer.set_branch(root_id, nodes)?;
        info!(node_id = root_id, count, "Refreshed cached branch");
        Ok(StepOutcome::Applied(count))
    }

    /// Reserved roots are not stored, so everything below one is read from a
    /// full load. An empty result is a valid empty root.
    async fn refresh_below_reserved(
        &self,
        writer: &mut GraphWriter<'_>,
        root_id: NodeId,
    ) -> Result<StepOutcome, CacheError> {
        let kits = match self.source.fetch_all_nodes().await {
            Ok(kits) => kits,
            Err(err) => {
                warn!(node_id = root_id, error = %err, "Content store unavailable; keeping cached branch");
                return Ok(StepOutcome::Deferred);
            }
        };

        let nodes: Vec<ContentNode> = kits
            .iter()
            .filter(|kit| below_reserved(&kit.node.path, root_id))
            .filter_map(|kit| self.build_node(kit))
            .collect();
        let count = nodes.len();
        writer.set_branch(root_id, nodes)?;
        info!(node_id = root_id, count, "Refreshed nodes below reserved root");
        Ok(StepOutcome::Applied(count))
    }

    fn build_node(&self, kit: &ContentNodeKit) -> Option<ContentNode> {
        if kit.is_empty() {
            warn!(node_id = kit.node.id, "Skipping node without draft or published data");
            return None;
        }
        match self.codec.build_node(kit) {
            Ok(node) => Some(node),
            Err(err) => {
                warn!(node_id = kit.node.id, error = %err, "Skipping node with unencodable properties");
                None
            }
        }
    }

    /// Rebuild the whole graph from the content store.
    ///
    /// Callers arriving while a rebuild runs join it and receive its result.
    pub async fn rebuild_all(self: &Arc<Self>) -> Result<RebuildReport, CacheError> {
        let rebuild = {
            let mut slot = mutex_lock(&self.rebuild, SOURCE, "rebuild_all");
            match slot.as_ref() {
                Some(in_flight) => {
                    info!("Joining in-flight rebuild");
                    in_flight.clone()
                }
                None => self.start_rebuild(&mut slot),
            }
        };
        rebuild.await
    }

    /// Rebuild, refusing instead of joining when one is already running.
    pub async fn rebuild_all_exclusive(self: &Arc<Self>) -> Result<RebuildReport, CacheError> {
        let rebuild = {
            let mut slot = mutex_lock(&self.rebuild, SOURCE, "rebuild_all_exclusive");
            if slot.is_some() {
                return Err(CacheError::ConcurrentRebuildInProgress);
            }
            self.start_rebuild(&mut slot)
        };
        rebuild.await
    }

    pub fn rebuild_in_progress(&self) -> bool {
        mutex_lock(&self.rebuild, SOURCE, "rebuild_in_progress").is_some()
    }

    fn start_rebuild(self: &Arc<Self>, slot: &mut Option<SharedRebuild>) -> SharedRebuild {
        let engine = Arc::clone(self);
        let rebuild = async move {
            let result = engine.run_rebuild().await;
            mutex_lock(&engine.rebuild, SOURCE, "rebuild_done").take();
            result
        }
        .boxed()
        .shared();
        *slot = Some(rebuild.clone());
        rebuild
    }

    /// Holds the writer for the whole read so no incremental batch interleaves.
    async fn run_rebuild(&self) -> Result<RebuildReport, CacheError> {
        let started_at = Instant::now();
        let mut writer = self.store.write().await;
        info!(base_generation = writer.graph().generation(), "Full rebuild starting");

        let kits = self.source.fetch_all_nodes().await.map_err(|err| {
            warn!(error = %err, "Full rebuild failed to read the content store; keeping cached graph");
            CacheError::store_unavailable(err)
        })?;

        let fetched = kits.len();
        let nodes: Vec<ContentNode> = kits.iter().filter_map(|kit| self.build_node(kit)).collect();
        let unbuildable = fetched - nodes.len();

        let (builder, stats) = GraphBuilder::from_nodes(nodes);
        writer.replace_all(builder);
        let generation = writer.commit();

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!(METRIC_REBUILD_MS).record(elapsed_ms as f64);
        counter!(METRIC_REBUILD_TOTAL).increment(1);

        let report = RebuildReport {
            generation,
            loaded: stats.loaded,
            skipped: stats.skipped + unbuildable,
            repaired_paths: stats.repaired_paths,
            elapsed_ms,
        };
        info!(
            generation,
            loaded = report.loaded,
            skipped = report.skipped,
            repaired_paths = report.repaired_paths,
            elapsed_ms,
            "Full rebuild complete"
        );
        Ok(report)
    }
}

/// Whether `path` lies below the reserved `root_id`. The tree root excludes
/// the recycle bins.
fn below_reserved(path: &NodePath, root_id: NodeId) -> bool {
    let top = path.segments().get(1).copied();
    match root_id {
        ROOT_ID => !matches!(top, Some(RECYCLE_BIN_CONTENT_ID | RECYCLE_BIN_MEDIA_ID)),
        bin => top == Some(bin) && path.last() != bin,
    }
}
