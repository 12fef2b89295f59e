//! Snapshot store: the current graph reference and its single writer.
//!
//! Reads are lock-free loads of an `Arc<ContentGraph>`. Writes are serialized
//! through [`GraphWriter`], built on a private copy, and published with one
//! atomic swap, so a reader never sees a half-applied change.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use metrics::gauge;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::domain::entities::ContentNode;
use crate::domain::types::{NodeId, NodeRef};

use super::error::CacheError;
use super::graph::{ContentGraph, GraphBuilder};

const METRIC_LIVE_SNAPSHOTS: &str = "nucache_live_snapshots";
const METRIC_GRAPH_NODES: &str = "nucache_graph_nodes";

/// Replacement for a single node.
#[derive(Debug, Clone)]
pub enum NodeChange {
    Upsert(ContentNode),
    /// Removes the node and its descendants; a lone removal would orphan them.
    Tombstone,
}

pub struct SnapshotStore {
    current: ArcSwap<ContentGraph>,
    writer: Mutex<()>,
    generation: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ContentGraph::empty()),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The current graph. Holding the `Arc` pins that generation.
    pub fn graph(&self) -> Arc<ContentGraph> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    /// Node in the current generation.
    pub fn get(&self, node: impl Into<NodeRef>) -> Option<Arc<ContentNode>> {
        self.current.load().resolve(node.into()).cloned()
    }

    pub fn live_snapshots(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Registers a reader; the count drops when the lease does.
    pub(crate) fn lease(&self) -> SnapshotLease {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(METRIC_LIVE_SNAPSHOTS).set(live as f64);
        SnapshotLease {
            live: Arc::clone(&self.live),
        }
    }

    /// Waits for exclusive write access.
    pub async fn write(&self) -> GraphWriter<'_> {
        let guard = self.writer.lock().await;
        GraphWriter {
            store: self,
            _guard: guard,
            base: self.graph(),
            pending: None,
        }
    }

    /// Replace or remove one node and publish the result.
    pub async fn apply(&self, id: NodeId, change: NodeChange) -> Result<u64, CacheError> {
        let mut writer = self.write().await;
        match change {
            NodeChange::Upsert(node) => {
                if node.record.id != id {
                    return Err(CacheError::inconsistent(
                        id,
                        format!("upsert carries node {}", node.record.id),
                    ));
                }
                writer.set(node)?;
            }
            NodeChange::Tombstone => {
                writer.clear_branch(id);
            }
        }
        Ok(writer.commit())
    }

    /// Replace the whole graph. Readers holding older generations keep them.
    pub async fn swap_full_graph(&self, graph: GraphBuilder) -> u64 {
        let mut writer = self.write().await;
        writer.replace_all(graph);
        writer.commit()
    }

    fn publish(&self, builder: GraphBuilder) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let graph = builder.finish(generation);
        let node_count = graph.len();
        self.current.store(Arc::new(graph));
        gauge!(METRIC_GRAPH_NODES).set(node_count as f64);
        info!(generation, node_count, "Published graph generation");
        generation
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive, transactional access to the next graph generation.
///
/// Changes are staged on a copy of the graph current when the writer was
/// acquired. Dropping the writer without [`commit`](Self::commit) discards
/// them.
pub struct GraphWriter<'a> {
    store: &'a SnapshotStore,
    _guard: MutexGuard<'a, ()>,
    base: Arc<ContentGraph>,
    pending: Option<GraphBuilder>,
}

impl GraphWriter<'_> {
    /// The graph as it would be published now.
    pub fn graph(&self) -> &ContentGraph {
        match &self.pending {
            Some(builder) => builder.graph(),
            None => self.base.as_ref(),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set(&mut self, node: ContentNode) -> Result<(), CacheError> {
        self.builder().set(node)
    }

    pub fn set_branch(&mut self, root_id: NodeId, nodes: Vec<ContentNode>) -> Result<(), CacheError> {
        self.builder().set_branch(root_id, nodes)
    }

    pub fn clear_branch(&mut self, root_id: NodeId) -> Vec<NodeId> {
        let graph = self.graph();
        if !graph.contains(root_id) && graph.child_ids(root_id).is_empty() {
            return Vec::new();
        }
        self.builder().clear_branch(root_id)
    }

    pub fn replace_all(&mut self, builder: GraphBuilder) {
        self.pending = Some(builder);
    }

    /// Publish staged changes. Returns the generation now current.
    pub fn commit(mut self) -> u64 {
        match self.pending.take() {
            Some(builder) => self.store.publish(builder),
            None => self.base.generation(),
        }
    }

    fn builder(&mut self) -> &mut GraphBuilder {
        let base = &self.base;
        self.pending.get_or_insert_with(|| base.to_builder())
    }
}

impl Drop for GraphWriter<'_> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            debug!(
                base_generation = self.base.generation(),
                "Discarding uncommitted graph changes"
            );
        }
    }
}

/// Counts a reader for as long as it is alive.
#[derive(Debug)]
pub(crate) struct SnapshotLease {
    live: Arc<AtomicUsize>,
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        let live = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!(METRIC_LIVE_SNAPSHOTS).set(live as f64);
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::domain::entities::ContentNodeRecord;
    use crate::domain::types::ItemKind;

    fn node(id: NodeId, parent_id: NodeId, path: &str) -> ContentNode {
        ContentNode {
            record: ContentNodeRecord {
                id,
                key: Uuid::from_u128(id as u128),
                kind: ItemKind::Document,
                parent_id,
                path: path.parse().expect("valid path"),
                sort_order: 0,
                content_type_id: 1,
                create_date: datetime!(2024-01-01 0:00 UTC),
                creator_id: 0,
                trashed: false,
            },
            draft: None,
            published: None,
        }
    }

    #[tokio::test]
    async fn apply_publishes_new_generation() {
        let store = SnapshotStore::new();
        assert_eq!(store.generation(), 0);

        let generation = store
            .apply(1, NodeChange::Upsert(node(1, -1, "-1,1")))
            .await
            .expect("apply");
        assert_eq!(generation, 1);
        assert!(store.get(1).is_some());
        assert!(store.get(Uuid::from_u128(1)).is_some());
    }

    #[tokio::test]
    async fn old_graph_survives_writes() {
        let store = SnapshotStore::new();
        store
            .apply(1, NodeChange::Upsert(node(1, -1, "-1,1")))
            .await
            .expect("apply");
        let pinned = store.graph();

        store.apply(1, NodeChange::Tombstone).await.expect("remove");
        assert!(store.get(1).is_none());
        assert!(pinned.get(1).is_some());
        assert_eq!(pinned.generation(), 1);
    }

    #[tokio::test]
    async fn failed_apply_leaves_graph_untouched() {
        let store = SnapshotStore::new();
        let err = store
            .apply(2, NodeChange::Upsert(node(2, 1, "-1,1,2")))
            .await
            .expect_err("parent missing");
        assert!(err.requires_rebuild());
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn dropped_writer_rolls_back() {
        let store = SnapshotStore::new();
        {
            let mut writer = store.write().await;
            writer.set(node(1, -1, "-1,1")).expect("set");
            assert!(writer.graph().contains(1));
        }
        assert!(store.get(1).is_none());
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn empty_commit_keeps_generation() {
        let store = SnapshotStore::new();
        let writer = store.write().await;
        assert_eq!(writer.commit(), 0);
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn swap_full_graph_replaces_everything() {
        let store = SnapshotStore::new();
        store
            .apply(1, NodeChange::Upsert(node(1, -1, "-1,1")))
            .await
            .expect("apply");

        let (builder, _) = GraphBuilder::from_nodes(vec![node(9, -1, "-1,9")]);
        let generation = store.swap_full_graph(builder).await;
        assert_eq!(generation, 2);
        assert!(store.get(1).is_none());
        assert!(store.get(9).is_some());
    }

    #[test]
    fn leases_track_live_readers() {
        let store = SnapshotStore::new();
        let first = store.lease();
        let second = store.lease();
        assert_eq!(store.live_snapshots(), 2);
        drop(first);
        assert_eq!(store.live_snapshots(), 1);
        drop(second);
        assert_eq!(store.live_snapshots(), 0);
    }
}
