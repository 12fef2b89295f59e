use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::types::NodeId;

use super::codec::CodecError;

/// Failures of the refresh and rebuild paths.
///
/// `Clone` so a single rebuild outcome can be handed to every caller that
/// joined it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("content store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: RepoError,
    },
    #[error("inconsistent graph at node {node_id}: {reason}")]
    InconsistentGraph { node_id: NodeId, reason: String },
    #[error("a full rebuild is already in progress")]
    ConcurrentRebuildInProgress,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CacheError {
    pub fn store_unavailable(source: RepoError) -> Self {
        Self::StoreUnavailable { source }
    }

    pub fn inconsistent(node_id: NodeId, reason: impl Into<String>) -> Self {
        Self::InconsistentGraph {
            node_id,
            reason: reason.into(),
        }
    }

    /// Structural errors heal through a full rebuild; the others do not.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, CacheError::InconsistentGraph { .. })
    }
}

impl From<RepoError> for CacheError {
    fn from(source: RepoError) -> Self {
        Self::store_unavailable(source)
    }
}
