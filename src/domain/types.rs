//! Shared domain enumerations and identifiers aligned with persisted database enums.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer node identifier assigned by the content store.
pub type NodeId = i32;

/// Parent id of every top-level node.
pub const ROOT_ID: NodeId = -1;
/// Reserved recycle-bin root for documents.
pub const RECYCLE_BIN_CONTENT_ID: NodeId = -20;
/// Reserved recycle-bin root for media.
pub const RECYCLE_BIN_MEDIA_ID: NodeId = -21;

/// True for the tree root and the recycle bins, which are never stored nodes.
pub fn is_reserved_root(id: NodeId) -> bool {
    matches!(id, ROOT_ID | RECYCLE_BIN_CONTENT_ID | RECYCLE_BIN_MEDIA_ID)
}

/// Item kinds sharing the cached node shape (mirrors Postgres enum `item_kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "item_kind", rename_all = "snake_case")]
pub enum ItemKind {
    Document,
    Media,
    Member,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Document => "document",
            ItemKind::Media => "media",
            ItemKind::Member => "member",
        }
    }

    /// Recycle-bin root for this kind. Members are deleted outright.
    pub fn recycle_bin_id(self) -> Option<NodeId> {
        match self {
            ItemKind::Document => Some(RECYCLE_BIN_CONTENT_ID),
            ItemKind::Media => Some(RECYCLE_BIN_MEDIA_ID),
            ItemKind::Member => None,
        }
    }
}

impl TryFrom<&str> for ItemKind {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "document" => Ok(ItemKind::Document),
            "media" => Ok(ItemKind::Media),
            "member" => Ok(ItemKind::Member),
            _ => Err(()),
        }
    }
}

/// What happened to a node in the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Saved,
    Published,
    Unpublished,
    Moved,
    Trashed,
    Restored,
    Deleted,
    Sorted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Saved => "saved",
            ChangeKind::Published => "published",
            ChangeKind::Unpublished => "unpublished",
            ChangeKind::Moved => "moved",
            ChangeKind::Trashed => "trashed",
            ChangeKind::Restored => "restored",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Sorted => "sorted",
        }
    }

    /// Changes that rewrite descendant paths or ordering, so the whole branch is re-fetched.
    pub fn affects_branch(self) -> bool {
        matches!(
            self,
            ChangeKind::Moved | ChangeKind::Trashed | ChangeKind::Restored | ChangeKind::Sorted
        )
    }

    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Deleted)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node reference by integer id or by stable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Id(NodeId),
    Key(Uuid),
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Id(id)
    }
}

impl From<Uuid> for NodeRef {
    fn from(key: Uuid) -> Self {
        NodeRef::Key(key)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Id(id) => write!(f, "{id}"),
            NodeRef::Key(key) => write!(f, "{key}"),
        }
    }
}

impl std::str::FromStr for NodeRef {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(id) = trimmed.parse::<NodeId>() {
            return Ok(NodeRef::Id(id));
        }
        Uuid::parse_str(trimmed)
            .map(NodeRef::Key)
            .map_err(|_| format!("`{trimmed}` is neither a node id nor a node key"))
    }
}
