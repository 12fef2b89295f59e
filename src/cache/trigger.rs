//! Cache trigger service.
//!
//! Entry point for the editing side: publish a change after its transaction
//! commits and, depending on configuration, apply it before returning.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::types::{ChangeKind, NodeId};

use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{ChangeTarget, EventQueue};
use super::refresh::{CacheRefreshEngine, ConsumeReport};

/// Publishes change notifications into the refresh engine.
///
/// ```ignore
/// // After the save transaction commits:
/// trigger.published(node.id).await?;
/// ```
pub struct CacheTrigger {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    engine: Arc<CacheRefreshEngine>,
}

impl CacheTrigger {
    pub fn new(engine: Arc<CacheRefreshEngine>) -> Self {
        Self {
            config: engine.config().clone(),
            queue: Arc::clone(engine.queue()),
            engine,
        }
    }

    /// Publish a change and optionally consume the queue now.
    ///
    /// Returns the consumption report when the queue was consumed. With the
    /// cache disabled the change is dropped.
    pub async fn trigger(
        &self,
        target: ChangeTarget,
        consume_now: bool,
    ) -> Result<Option<ConsumeReport>, CacheError> {
        if !self.config.enabled {
            debug!(target = %target, "Cache trigger skipped: cache disabled");
            return Ok(None);
        }

        self.queue.publish(target);

        if !consume_now {
            return Ok(None);
        }
        match self.engine.consume().await {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                warn!(error = %err, "Inline cache refresh failed");
                Err(err)
            }
        }
    }

    /// Notify a change to one node. Branch-shaped changes cover descendants.
    pub async fn node_changed(
        &self,
        node_id: NodeId,
        change: ChangeKind,
    ) -> Result<Option<ConsumeReport>, CacheError> {
        let target = if change.affects_branch() {
            ChangeTarget::branch(node_id, change)
        } else {
            ChangeTarget::node(node_id, change)
        };
        self.trigger(target, self.config.consume_on_trigger).await
    }

    /// Notify a change covering `root_id` and everything below it.
    pub async fn branch_changed(
        &self,
        root_id: NodeId,
        change: ChangeKind,
    ) -> Result<Option<ConsumeReport>, CacheError> {
        self.trigger(
            ChangeTarget::branch(root_id, change),
            self.config.consume_on_trigger,
        )
        .await
    }

    pub async fn saved(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Saved).await
    }

    pub async fn published(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Published).await
    }

    pub async fn unpublished(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Unpublished).await
    }

    pub async fn moved(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Moved).await
    }

    pub async fn trashed(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Trashed).await
    }

    pub async fn restored(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Restored).await
    }

    pub async fn deleted(&self, node_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(node_id, ChangeKind::Deleted).await
    }

    /// Children of `parent_id` were reordered.
    pub async fn sorted(&self, parent_id: NodeId) -> Result<Option<ConsumeReport>, CacheError> {
        self.node_changed(parent_id, ChangeKind::Sorted).await
    }

    /// Everything may have changed; the next consumption rebuilds.
    pub async fn refresh_all(&self) -> Result<Option<ConsumeReport>, CacheError> {
        self.trigger(ChangeTarget::All, self.config.consume_on_trigger)
            .await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<CacheRefreshEngine> {
        &self.engine
    }
}
