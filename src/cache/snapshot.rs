//! Reader handles bound to one graph generation.

use std::sync::Arc;

use crate::domain::entities::ContentNodeRecord;
use crate::domain::types::{ItemKind, NodeId, NodeRef, ROOT_ID};

use super::graph::ContentGraph;
use super::published::{PublishedChildren, PublishedContent, PublishedContentFactory};
use super::store::SnapshotLease;

/// How a snapshot's reads are resolved by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewContext {
    /// Read drafts instead of published versions.
    pub preview: bool,
    /// Culture used when a read does not name one.
    pub culture: Option<String>,
}

impl PreviewContext {
    pub fn published() -> Self {
        Self::default()
    }

    pub fn preview() -> Self {
        Self {
            preview: true,
            culture: None,
        }
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = Some(culture.into());
        self
    }
}

/// A point-in-time view of the cache.
///
/// Everything read through a snapshot comes from the generation that was
/// current when it was created. Drop it (or call [`release`](Self::release))
/// to let that generation go.
pub struct Snapshot {
    graph: Arc<ContentGraph>,
    factory: Arc<PublishedContentFactory>,
    context: PreviewContext,
    _lease: SnapshotLease,
}

impl Snapshot {
    pub(crate) fn new(
        graph: Arc<ContentGraph>,
        factory: Arc<PublishedContentFactory>,
        context: PreviewContext,
        lease: SnapshotLease,
    ) -> Self {
        Self {
            graph,
            factory,
            context,
            _lease: lease,
        }
    }

    pub fn generation(&self) -> u64 {
        self.graph.generation()
    }

    pub fn context(&self) -> &PreviewContext {
        &self.context
    }

    pub fn graph(&self) -> &ContentGraph {
        &self.graph
    }

    /// Raw record, whatever its publish state.
    pub fn get(&self, node: impl Into<NodeRef>) -> Option<&ContentNodeRecord> {
        self.graph.resolve(node.into()).map(|node| &node.record)
    }

    /// Raw child records in sort order.
    pub fn children(
        &self,
        parent_id: NodeId,
        include_trashed: bool,
    ) -> impl Iterator<Item = &ContentNodeRecord> + Clone {
        self.graph
            .children(parent_id, include_trashed)
            .map(|node| &node.record)
    }

    /// Top-level records of a recycle bin. Empty for kinds without one.
    pub fn recycle_bin(&self, kind: ItemKind) -> Vec<&ContentNodeRecord> {
        kind.recycle_bin_id()
            .map(|bin| self.children(bin, true).collect())
            .unwrap_or_default()
    }

    pub fn content(&self) -> PublishedCache<'_> {
        self.cache(ItemKind::Document)
    }

    pub fn media(&self) -> PublishedCache<'_> {
        self.cache(ItemKind::Media)
    }

    pub fn members(&self) -> PublishedCache<'_> {
        self.cache(ItemKind::Member)
    }

    pub fn cache(&self, kind: ItemKind) -> PublishedCache<'_> {
        PublishedCache {
            snapshot: self,
            kind,
        }
    }

    /// Explicitly end the scoped acquisition.
    pub fn release(self) {}
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation())
            .field("context", &self.context)
            .finish()
    }
}

/// Published reads of one item kind within a snapshot.
#[derive(Clone, Copy)]
pub struct PublishedCache<'a> {
    snapshot: &'a Snapshot,
    kind: ItemKind,
}

impl PublishedCache<'_> {
    /// Read using the snapshot's preview mode and culture.
    pub fn get(&self, node: impl Into<NodeRef>) -> Option<PublishedContent> {
        self.get_by_id(self.snapshot.context.preview, node)
    }

    pub fn get_by_id(&self, preview: bool, node: impl Into<NodeRef>) -> Option<PublishedContent> {
        self.build(preview, node.into(), self.snapshot.context.culture.as_deref())
    }

    pub fn get_by_id_for_culture(
        &self,
        preview: bool,
        node: impl Into<NodeRef>,
        culture: &str,
    ) -> Option<PublishedContent> {
        self.build(preview, node.into(), Some(culture))
    }

    /// Visible top-level items of this kind.
    pub fn at_root(&self, preview: bool) -> PublishedChildren {
        self.children_of(preview, ROOT_ID)
    }

    /// Visible children of `parent`. Empty when the parent is unknown.
    pub fn children(&self, preview: bool, parent: impl Into<NodeRef>) -> PublishedChildren {
        let parent_id = match parent.into() {
            NodeRef::Id(id) => id,
            NodeRef::Key(key) => self
                .snapshot
                .graph
                .get_by_key(key)
                .map_or(NodeId::MIN, |node| node.id()),
        };
        self.children_of(preview, parent_id)
    }

    pub fn has_content(&self, preview: bool) -> bool {
        self.at_root(preview).next().is_some()
    }

    fn children_of(&self, preview: bool, parent_id: NodeId) -> PublishedChildren {
        PublishedChildren::new(
            Arc::clone(&self.snapshot.graph),
            Arc::clone(&self.snapshot.factory),
            parent_id,
            Some(self.kind),
            preview,
            self.snapshot.context.culture.clone(),
        )
    }

    fn build(&self, preview: bool, node: NodeRef, culture: Option<&str>) -> Option<PublishedContent> {
        let snapshot = self.snapshot;
        let node = snapshot.graph.resolve(node)?;
        if node.record.kind != self.kind {
            return None;
        }
        snapshot
            .factory
            .build(&snapshot.graph, node, culture, preview)
    }
}
