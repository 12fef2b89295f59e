//! Materialized ancestor paths (`-1,1047,1048`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DomainError;
use super::types::{NodeId, ROOT_ID};

/// Ordered ancestor chain from the root to a node, inclusive of both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath(Vec<NodeId>);

impl NodePath {
    pub fn root() -> Self {
        Self(vec![ROOT_ID])
    }

    pub fn from_segments(segments: Vec<NodeId>) -> Result<Self, DomainError> {
        match segments.first() {
            Some(&ROOT_ID) => Ok(Self(segments)),
            Some(other) => Err(DomainError::validation(format!(
                "path must start at root {ROOT_ID}, found {other}"
            ))),
            None => Err(DomainError::validation("path must not be empty")),
        }
    }

    pub fn segments(&self) -> &[NodeId] {
        &self.0
    }

    /// Path of a direct child of this path.
    pub fn child(&self, id: NodeId) -> Self {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend_from_slice(&self.0);
        segments.push(id);
        Self(segments)
    }

    /// Tree depth; the root path has level 0.
    pub fn level(&self) -> usize {
        self.0.len() - 1
    }

    pub fn last(&self) -> NodeId {
        self.0.last().copied().unwrap_or(ROOT_ID)
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        let len = self.0.len();
        (len >= 2).then(|| self.0[len - 2])
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains(&id)
    }

    pub fn starts_with(&self, prefix: &NodePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Re-roots `self` from `old_prefix` onto `new_prefix`.
    pub fn rebase(&self, old_prefix: &NodePath, new_prefix: &NodePath) -> Option<Self> {
        let rest = self.0.strip_prefix(old_prefix.0.as_slice())?;
        let mut segments = new_prefix.0.clone();
        segments.extend_from_slice(rest);
        Some(Self(segments))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for NodePath {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let segments = value
            .split(',')
            .map(|part| {
                part.trim().parse::<NodeId>().map_err(|err| {
                    DomainError::validation(format!("invalid path segment `{part}`: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_segments(segments)
    }
}

impl Serialize for NodePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
