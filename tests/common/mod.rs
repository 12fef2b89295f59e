#![allow(dead_code)]

use std::sync::Arc;

use nucache::cache::{
    CacheConfig, CacheTrigger, PreviewContext, PublishedContent, PublishedSnapshotService,
};
use nucache::domain::types::NodeId;
use nucache::infra::memory::InMemoryVersionStore;

/// A cache wired to an in-memory content store.
pub struct Harness {
    pub source: Arc<InMemoryVersionStore>,
    pub service: PublishedSnapshotService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let source = Arc::new(InMemoryVersionStore::new());
        let service = PublishedSnapshotService::new(config, source.clone());
        Self { source, service }
    }

    pub fn trigger(&self) -> &CacheTrigger {
        self.service.trigger()
    }

    pub fn published(&self, id: NodeId) -> Option<PublishedContent> {
        self.service
            .create_snapshot(PreviewContext::published())
            .content()
            .get(id)
    }

    pub fn preview(&self, id: NodeId) -> Option<PublishedContent> {
        self.service
            .create_snapshot(PreviewContext::preview())
            .content()
            .get(id)
    }

    pub fn published_name(&self, id: NodeId) -> Option<String> {
        self.published(id).map(|content| content.name().to_string())
    }
}

pub fn names(contents: impl Iterator<Item = PublishedContent>) -> Vec<String> {
    contents.map(|content| content.name().to_string()).collect()
}

pub fn ids(contents: impl Iterator<Item = PublishedContent>) -> Vec<NodeId> {
    contents.map(|content| content.id()).collect()
}
