//! Immutable content graph and its copy-on-write builder.
//!
//! A [`ContentGraph`] is never mutated once published. Writers clone it into a
//! [`GraphBuilder`] (node payloads are shared through `Arc`), apply their
//! changes, and publish the result as a new generation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::domain::entities::ContentNode;
use crate::domain::path::NodePath;
use crate::domain::types::{
    NodeId, NodeRef, RECYCLE_BIN_CONTENT_ID, RECYCLE_BIN_MEDIA_ID, ROOT_ID, is_reserved_root,
};

use super::error::CacheError;

/// One consistent generation of the cached tree.
#[derive(Debug, Clone, Default)]
pub struct ContentGraph {
    generation: u64,
    nodes: HashMap<NodeId, Arc<ContentNode>>,
    keys: HashMap<Uuid, NodeId>,
    /// Child ids per parent, ordered by `(sort_order, id)`. Includes trashed nodes.
    children: HashMap<NodeId, Arc<Vec<NodeId>>>,
}

impl ContentGraph {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<ContentNode>> {
        self.nodes.get(&id)
    }

    pub fn get_by_key(&self, key: Uuid) -> Option<&Arc<ContentNode>> {
        self.keys.get(&key).and_then(|id| self.nodes.get(id))
    }

    pub fn resolve(&self, node: NodeRef) -> Option<&Arc<ContentNode>> {
        match node {
            NodeRef::Id(id) => self.get(id),
            NodeRef::Key(key) => self.get_by_key(key),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Every cached node, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ContentNode>> {
        self.nodes.values()
    }

    pub fn child_ids(&self, parent_id: NodeId) -> &[NodeId] {
        self.children
            .get(&parent_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Children of `parent_id` in sort order. Trashed nodes are skipped unless
    /// `include_trashed` is set. A clone continues from the current position;
    /// call again to start from the first child.
    pub fn children(&self, parent_id: NodeId, include_trashed: bool) -> Children<'_> {
        Children {
            graph: self,
            ids: self.child_ids(parent_id).iter(),
            include_trashed,
        }
    }

    /// All ids below `id`, parents before children.
    pub fn descendant_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.child_ids(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.child_ids(next).iter().rev().copied());
        }
        out
    }

    /// Cached ancestors of `id`, nearest first, stopping at a reserved root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            graph: self,
            next: self.get(id).map(|node| node.record.parent_id),
        }
    }

    /// Path a child of `parent_id` extends, if the parent resolves.
    pub fn path_of(&self, parent_id: NodeId) -> Option<NodePath> {
        match parent_id {
            ROOT_ID => Some(NodePath::root()),
            RECYCLE_BIN_CONTENT_ID | RECYCLE_BIN_MEDIA_ID => Some(NodePath::root().child(parent_id)),
            id => self.nodes.get(&id).map(|node| node.record.path.clone()),
        }
    }

    /// Checks every structural invariant of the graph.
    pub fn verify(&self) -> Result<(), CacheError> {
        for (&id, node) in &self.nodes {
            let record = &node.record;
            if record.id != id {
                return Err(CacheError::inconsistent(id, "node stored under a foreign id"));
            }
            if self.keys.get(&record.key) != Some(&id) {
                return Err(CacheError::inconsistent(id, "key does not resolve to node"));
            }
            check_placement(self, node)?;
            if !self.child_ids(record.parent_id).contains(&id) {
                return Err(CacheError::inconsistent(id, "node missing from parent's children"));
            }
        }

        for (&parent_id, ids) in &self.children {
            let mut previous: Option<(i32, NodeId)> = None;
            for &child in ids.iter() {
                let Some(node) = self.nodes.get(&child) else {
                    return Err(CacheError::inconsistent(child, "dangling child reference"));
                };
                if node.record.parent_id != parent_id {
                    return Err(CacheError::inconsistent(child, "listed under the wrong parent"));
                }
                let key = (node.record.sort_order, child);
                if previous.is_some_and(|prev| prev > key) {
                    return Err(CacheError::inconsistent(child, "children out of sort order"));
                }
                previous = Some(key);
            }
        }

        if self.keys.len() != self.nodes.len() {
            return Err(CacheError::inconsistent(ROOT_ID, "key index out of sync"));
        }
        Ok(())
    }

    /// Starts a copy-on-write edit of this graph.
    pub fn to_builder(&self) -> GraphBuilder {
        GraphBuilder {
            graph: self.clone(),
        }
    }
}

/// Lazy, finite child iterator bound to one graph generation.
#[derive(Clone)]
pub struct Children<'a> {
    graph: &'a ContentGraph,
    ids: std::slice::Iter<'a, NodeId>,
    include_trashed: bool,
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a Arc<ContentNode>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            if let Some(node) = self.graph.nodes.get(id)
                && (self.include_trashed || !node.record.trashed)
            {
                return Some(node);
            }
        }
        None
    }
}

pub struct Ancestors<'a> {
    graph: &'a ContentGraph,
    next: Option<NodeId>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Arc<ContentNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.graph.nodes.get(&self.next?)?;
        self.next = Some(node.record.parent_id);
        Some(node)
    }
}

/// Counts reported by a lenient load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    pub skipped: usize,
    pub repaired_paths: usize,
}

/// Mutable working copy of a graph.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: ContentGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads see the pending state.
    pub fn graph(&self) -> &ContentGraph {
        &self.graph
    }

    /// Inserts or replaces one node, enforcing every placement invariant.
    ///
    /// Fails without modifying the builder when the parent is not cached, the
    /// path does not extend the parent's path, the key changed, or a node
    /// that still has cached children would move.
    pub fn set(&mut self, node: ContentNode) -> Result<(), CacheError> {
        let id = node.record.id;
        check_placement(&self.graph, &node)?;

        if let Some(&owner) = self.graph.keys.get(&node.record.key)
            && owner != id
        {
            return Err(CacheError::inconsistent(
                id,
                format!("key {} already belongs to node {owner}", node.record.key),
            ));
        }

        if let Some(existing) = self.graph.nodes.get(&id) {
            if existing.record.key != node.record.key {
                return Err(CacheError::inconsistent(id, "node key changed"));
            }
            if existing.record.path != node.record.path && !self.graph.child_ids(id).is_empty() {
                return Err(CacheError::inconsistent(
                    id,
                    format!(
                        "node moved from {} to {} with cached descendants",
                        existing.record.path, node.record.path
                    ),
                ));
            }
            let old_parent = existing.record.parent_id;
            self.detach(old_parent, id);
        }

        self.insert(node);
        Ok(())
    }

    /// Replaces the branch rooted at `root_id` with `nodes`.
    ///
    /// The cached branch is cleared first; `nodes` are re-inserted parents first.
    pub fn set_branch(&mut self, root_id: NodeId, nodes: Vec<ContentNode>) -> Result<(), CacheError> {
        self.clear_branch(root_id);
        for node in parents_first(nodes) {
            self.set(node)?;
        }
        Ok(())
    }

    /// Removes `root_id` and everything below it. Returns the removed ids.
    ///
    /// A reserved root is never stored, so only the branches below it go.
    pub fn clear_branch(&mut self, root_id: NodeId) -> Vec<NodeId> {
        if is_reserved_root(root_id) {
            let mut removed = Vec::new();
            for child in self.graph.child_ids(root_id).to_vec() {
                removed.extend(self.clear_branch(child));
            }
            return removed;
        }

        let Some(root) = self.graph.nodes.get(&root_id) else {
            return Vec::new();
        };
        let parent_id = root.record.parent_id;

        let mut removed = vec![root_id];
        removed.extend(self.graph.descendant_ids(root_id));
        for id in &removed {
            if let Some(node) = self.graph.nodes.remove(id) {
                self.graph.keys.remove(&node.record.key);
            }
            self.graph.children.remove(id);
        }
        self.detach(parent_id, root_id);
        removed
    }

    /// Builds from a full load, skipping nodes that cannot be placed.
    ///
    /// Nodes are placed by `parent_id`, parents first. Nodes whose parent is
    /// absent are skipped. A stored path that disagrees with the parent's path
    /// is replaced by the recomputed one.
    pub fn from_nodes(nodes: Vec<ContentNode>) -> (Self, LoadStats) {
        let mut builder = Self::new();
        let mut stats = LoadStats::default();

        for mut node in parents_first(nodes) {
            let id = node.record.id;
            let Some(parent_path) = builder.graph.path_of(node.record.parent_id) else {
                warn!(
                    node_id = id,
                    parent_id = node.record.parent_id,
                    "Skipping node whose parent is not loaded"
                );
                stats.skipped += 1;
                continue;
            };

            if builder.graph.nodes.contains_key(&id) || builder.graph.keys.contains_key(&node.record.key) {
                warn!(node_id = id, key = %node.record.key, "Skipping duplicate node");
                stats.skipped += 1;
                continue;
            }

            let expected = parent_path.child(id);
            if node.record.path != expected {
                warn!(
                    node_id = id,
                    stored_path = %node.record.path,
                    path = %expected,
                    "Repairing stored path"
                );
                node.record.path = expected;
                stats.repaired_paths += 1;
            }

            if node.record.trashed && !under_recycle_bin(&node.record.path) {
                warn!(node_id = id, path = %node.record.path, "Skipping trashed node outside recycle bin");
                stats.skipped += 1;
                continue;
            }

            builder.insert(node);
            stats.loaded += 1;
        }

        (builder, stats)
    }

    pub fn finish(mut self, generation: u64) -> ContentGraph {
        self.graph.generation = generation;
        self.graph
    }

    fn insert(&mut self, node: ContentNode) {
        let id = node.record.id;
        let parent_id = node.record.parent_id;
        self.graph.keys.insert(node.record.key, id);
        self.graph.nodes.insert(id, Arc::new(node));

        let nodes = &self.graph.nodes;
        let sort_key = |child: &NodeId| {
            (
                nodes.get(child).map_or(i32::MAX, |n| n.record.sort_order),
                *child,
            )
        };
        let own_key = sort_key(&id);
        let siblings = Arc::make_mut(self.graph.children.entry(parent_id).or_default());
        siblings.retain(|child| *child != id);
        let at = siblings.partition_point(|child| sort_key(child) < own_key);
        siblings.insert(at, id);
    }

    fn detach(&mut self, parent_id: NodeId, id: NodeId) {
        if let Some(siblings) = self.graph.children.get_mut(&parent_id) {
            if !siblings.contains(&id) {
                return;
            }
            let remaining = Arc::make_mut(siblings);
            remaining.retain(|child| *child != id);
            if remaining.is_empty() {
                self.graph.children.remove(&parent_id);
            }
        }
    }
}

/// Orders `nodes` so each one follows its parent, walking `parent_id` links
/// down from every parent outside the set. Stored paths are ignored. Nodes on
/// a parent cycle are never reached and come last.
fn parents_first(nodes: Vec<ContentNode>) -> Vec<ContentNode> {
    let total = nodes.len();
    let ids: HashSet<NodeId> = nodes.iter().map(|node| node.record.id).collect();
    let mut by_parent: HashMap<NodeId, Vec<ContentNode>> = HashMap::new();
    for node in nodes {
        by_parent.entry(node.record.parent_id).or_default().push(node);
    }
    for siblings in by_parent.values_mut() {
        siblings.sort_by_key(|node| (node.record.sort_order, node.record.id));
    }

    let mut anchors: Vec<NodeId> = by_parent
        .keys()
        .copied()
        .filter(|parent_id| !ids.contains(parent_id))
        .collect();
    anchors.sort_unstable();

    let mut ordered = Vec::with_capacity(total);
    let mut pending: VecDeque<NodeId> = anchors.into();
    while let Some(parent_id) = pending.pop_front() {
        let Some(children) = by_parent.remove(&parent_id) else {
            continue;
        };
        for child in children {
            pending.push_back(child.record.id);
            ordered.push(child);
        }
    }

    let mut unreachable: Vec<ContentNode> = by_parent.into_values().flatten().collect();
    unreachable.sort_by_key(|node| node.record.id);
    ordered.extend(unreachable);
    ordered
}

fn under_recycle_bin(path: &NodePath) -> bool {
    matches!(
        path.segments().get(1),
        Some(&(RECYCLE_BIN_CONTENT_ID | RECYCLE_BIN_MEDIA_ID))
    )
}

fn check_placement(graph: &ContentGraph, node: &ContentNode) -> Result<(), CacheError> {
    let record = &node.record;
    let Some(parent_path) = graph.path_of(record.parent_id) else {
        return Err(CacheError::inconsistent(
            record.id,
            format!("parent {} is not cached", record.parent_id),
        ));
    };
    if parent_path.contains(record.id) {
        return Err(CacheError::inconsistent(
            record.id,
            format!("node would become its own ancestor under {parent_path}"),
        ));
    }
    if record.path != parent_path.child(record.id) {
        return Err(CacheError::inconsistent(
            record.id,
            format!("path {} does not extend parent path {parent_path}", record.path),
        ));
    }
    if record.trashed && !under_recycle_bin(&record.path) {
        return Err(CacheError::inconsistent(
            record.id,
            "trashed node outside the recycle bin",
        ));
    }
    Ok(())
}
