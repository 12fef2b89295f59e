//! Repository traits describing the content store the cache reads from.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::ContentNodeKit;
use crate::domain::types::NodeId;

#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("content store unavailable: {0}")]
    Unavailable(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Read-only access to committed draft and published content.
///
/// Every method observes committed state only. Callers trigger refreshes after
/// the originating transaction has completed.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Node with its draft and published versions, or `None` when it no longer exists.
    async fn fetch_node(&self, id: NodeId) -> Result<Option<ContentNodeKit>, RepoError>;

    /// Ids of every node below `id`, at any depth.
    async fn fetch_descendant_ids(&self, id: NodeId) -> Result<Vec<NodeId>, RepoError>;

    /// The node plus all descendants, ordered by level then sort order.
    ///
    /// The default implementation issues one fetch per node. Adapters that can
    /// read a branch in a single statement should override it.
    async fn fetch_branch(&self, id: NodeId) -> Result<Vec<ContentNodeKit>, RepoError> {
        let Some(root) = self.fetch_node(id).await? else {
            return Ok(Vec::new());
        };

        let mut kits = vec![root];
        for descendant in self.fetch_descendant_ids(id).await? {
            if let Some(kit) = self.fetch_node(descendant).await? {
                kits.push(kit);
            }
        }
        sort_kits(&mut kits);
        Ok(kits)
    }

    /// Every node, read as one consistent view of the store.
    async fn fetch_all_nodes(&self) -> Result<Vec<ContentNodeKit>, RepoError>;
}

/// Orders kits so parents precede children and siblings follow sort order.
pub fn sort_kits(kits: &mut [ContentNodeKit]) {
    kits.sort_by(|a, b| {
        a.node
            .level()
            .cmp(&b.node.level())
            .then(a.node.parent_id.cmp(&b.node.parent_id))
            .then(a.node.sort_order.cmp(&b.node.sort_order))
            .then(a.node.id.cmp(&b.node.id))
    });
}
