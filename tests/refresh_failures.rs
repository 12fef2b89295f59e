mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use common::Harness;
use nucache::application::repos::{RepoError, VersionStore};
use nucache::cache::{CacheConfig, CacheError, ChangeTarget, PropertyCodec, PublishedSnapshotService};
use nucache::domain::entities::{ContentNodeKit, ContentNodeVersion};
use nucache::domain::types::{ChangeKind, NodeId};
use nucache::infra::memory::{InMemoryVersionStore, NewNode};
use tokio::sync::Notify;
use uuid::Uuid;

#[tokio::test]
async fn unavailable_store_defers_and_keeps_cached_state() {
    let harness = Harness::new();
    let source = &harness.source;
    let node = source.create(NewNode::document("Stable")).expect("create");
    source.publish(node.id).expect("publish");
    harness.service.rebuild_all().await.expect("rebuild");
    let generation = harness.service.generation();

    source.rename(node.id, "Changed").expect("rename");
    source.publish(node.id).expect("publish");
    source.set_available(false);

    let report = harness
        .trigger()
        .published(node.id)
        .await
        .expect("deferred, not failed")
        .expect("consumed inline");
    assert_eq!(report.deferred, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(harness.published_name(node.id).as_deref(), Some("Stable"));
    assert_eq!(harness.service.generation(), generation);

    source.set_available(true);
    harness.trigger().published(node.id).await.expect("published");
    assert_eq!(harness.published_name(node.id).as_deref(), Some("Changed"));
}

#[tokio::test]
async fn failed_rebuild_keeps_graph_and_requeues() {
    let harness = Harness::new();
    let source = &harness.source;
    let node = source.create(NewNode::document("Kept")).expect("create");
    source.publish(node.id).expect("publish");
    harness.service.rebuild_all().await.expect("rebuild");

    source.set_available(false);
    let err = harness
        .trigger()
        .refresh_all()
        .await
        .expect_err("store is down");
    assert!(matches!(err, CacheError::StoreUnavailable { .. }));
    assert_eq!(harness.published_name(node.id).as_deref(), Some("Kept"));
    assert_eq!(harness.service.engine().queue().len(), 1);

    source.set_available(true);
    let report = harness.service.engine().consume().await.expect("retry");
    assert!(report.rebuild.is_some());
    assert!(harness.service.engine().queue().is_empty());
}

#[tokio::test]
async fn unplaceable_node_escalates_to_rebuild() {
    let harness = Harness::new();
    let source = &harness.source;
    harness.service.rebuild_all().await.expect("rebuild");

    let parent = source.create(NewNode::document("Parent")).expect("parent");
    let child = source
        .create(NewNode::document("Child").under(parent.id))
        .expect("child");
    for id in [parent.id, child.id] {
        source.publish(id).expect("publish");
    }

    // Only the child is announced; its parent was never cached.
    let report = harness
        .trigger()
        .published(child.id)
        .await
        .expect("published")
        .expect("consumed inline");
    let rebuild = report.rebuild.expect("escalated to rebuild");
    assert_eq!(rebuild.loaded, 2);
    assert!(harness.published(child.id).is_some());
    harness
        .service
        .published_snapshot()
        .graph()
        .verify()
        .expect("consistent graph");
}

#[tokio::test]
async fn rebuild_skips_nodes_it_cannot_place() {
    let harness = Harness::new();
    let source = &harness.source;
    let good = source.create(NewNode::document("Good")).expect("good");
    source.publish(good.id).expect("publish");
    let template = source
        .fetch_node(good.id)
        .await
        .expect("fetch")
        .expect("kit");

    let mut orphan = template.clone();
    orphan.node.id = 500;
    orphan.node.key = Uuid::new_v4();
    orphan.node.parent_id = 999;
    orphan.node.path = "-1,999,500".parse().expect("path");
    source.insert_raw(orphan);

    let mut empty = template.clone();
    empty.node.id = 501;
    empty.node.key = Uuid::new_v4();
    empty.node.path = "-1,501".parse().expect("path");
    empty.draft = None;
    empty.published = None;
    source.insert_raw(empty);

    let mut misplaced = template.clone();
    misplaced.node.id = 502;
    misplaced.node.key = Uuid::new_v4();
    misplaced.node.parent_id = good.id;
    misplaced.node.path = "-1,502".parse().expect("path");
    misplaced.node.sort_order = 0;
    source.insert_raw(misplaced);

    let report = harness.service.rebuild_all().await.expect("rebuild");
    assert_eq!(report.loaded, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.repaired_paths, 1);

    let snapshot = harness.service.published_snapshot();
    assert!(snapshot.get(500).is_none());
    assert!(snapshot.get(501).is_none());
    assert_eq!(
        snapshot.get(502).map(|record| record.path.to_string()),
        Some(format!("-1,{},502", good.id))
    );
}

#[tokio::test]
async fn rebuild_repairs_path_shallower_than_parent() {
    let harness = Harness::new();
    let source = &harness.source;
    let parent = source.create(NewNode::document("Parent")).expect("parent");
    source.publish(parent.id).expect("publish");
    let template = source
        .fetch_node(parent.id)
        .await
        .expect("fetch")
        .expect("kit");

    // Id 0 orders before the parent, and the stored path puts it at the top.
    let mut stray = template;
    stray.node.id = 0;
    stray.node.key = Uuid::new_v4();
    stray.node.parent_id = parent.id;
    stray.node.path = "-1,0".parse().expect("path");
    source.insert_raw(stray);

    let report = harness.service.rebuild_all().await.expect("rebuild");
    assert_eq!(report.loaded, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.repaired_paths, 1);

    let snapshot = harness.service.published_snapshot();
    assert_eq!(
        snapshot.get(0).map(|record| record.path.to_string()),
        Some(format!("-1,{},0", parent.id))
    );
    snapshot.graph().verify().expect("consistent graph");
}

#[tokio::test]
async fn rebuild_matches_store_contents() {
    let harness = Harness::new();
    let source = &harness.source;
    let root = source
        .create(NewNode::document("Root").with_value("title", "Root title"))
        .expect("root");
    let draft_child = source
        .create(NewNode::document("Draft child").under(root.id))
        .expect("child");
    let media = source
        .create(NewNode::media("Banner").with_value("umbracoFile", "/media/banner.jpg"))
        .expect("media");
    source.publish(root.id).expect("publish");
    source.publish(media.id).expect("publish");
    source.set_value(root.id, "title", "Draft title").expect("edit");

    harness.service.rebuild_all().await.expect("rebuild");

    let codec = PropertyCodec::default();
    let store = harness.service.store();
    for id in source.node_ids() {
        let kit = source.fetch_node(id).await.expect("fetch").expect("kit");
        let cached = store.get(id).expect("cached node");
        assert_eq!(cached.record, kit.node);
        let decode = |version: Option<&Arc<ContentNodeVersion>>| {
            version.map(|version| codec.decode_version(version).expect("decodable"))
        };
        assert_eq!(decode(cached.draft.as_ref()), kit.draft, "draft of {id}");
        assert_eq!(decode(cached.published.as_ref()), kit.published, "published of {id}");
    }
    assert!(store.get(draft_child.id).is_some_and(|node| !node.is_published()));
}

#[tokio::test]
async fn repeated_notifications_are_idempotent() {
    let harness = Harness::new();
    let source = &harness.source;
    let node = source
        .create(NewNode::document("Same").with_value("count", 3_i64))
        .expect("create");
    source.publish(node.id).expect("publish");
    harness.trigger().published(node.id).await.expect("first");
    let first = harness.published(node.id).expect("view").to_view();

    for _ in 0..3 {
        harness.trigger().saved(node.id).await.expect("saved");
    }
    let again = harness.published(node.id).expect("view").to_view();

    assert_eq!(first.name, again.name);
    assert_eq!(first.values, again.values);
    assert!(again.generation > first.generation);
    assert_eq!(harness.service.published_snapshot().graph().len(), 1);
}

#[tokio::test]
async fn events_wait_for_consumption_when_not_inline() {
    let harness = Harness::with_config(CacheConfig {
        consume_on_trigger: false,
        ..CacheConfig::default()
    });
    let source = &harness.source;
    let node = source.create(NewNode::document("Queued")).expect("create");
    source.publish(node.id).expect("publish");

    let outcome = harness.trigger().published(node.id).await.expect("queued");
    assert!(outcome.is_none());
    assert!(harness.published(node.id).is_none());

    let report = harness.service.engine().consume().await.expect("consume");
    assert_eq!(report.events, 1);
    assert_eq!(report.applied, 1);
    assert!(harness.published(node.id).is_some());
}

#[tokio::test]
async fn disabled_cache_ignores_notifications() {
    let harness = Harness::with_config(CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    });
    let node = harness
        .source
        .create(NewNode::document("Ignored"))
        .expect("create");
    harness.source.publish(node.id).expect("publish");

    let outcome = harness.trigger().published(node.id).await.expect("ignored");
    assert!(outcome.is_none());
    assert!(harness.service.engine().queue().is_empty());

    harness.service.rebuild_all().await.expect("rebuild");
    assert!(harness.published(node.id).is_some());
}

#[tokio::test]
async fn batch_applies_events_in_epoch_order() {
    let harness = Harness::with_config(CacheConfig {
        consume_on_trigger: false,
        ..CacheConfig::default()
    });
    let source = &harness.source;
    let node = source.create(NewNode::document("Short lived")).expect("create");
    source.publish(node.id).expect("publish");
    harness.service.rebuild_all().await.expect("rebuild");

    let queue = harness.service.engine().queue();
    queue.publish(ChangeTarget::node(node.id, ChangeKind::Saved));
    queue.publish(ChangeTarget::node(node.id, ChangeKind::Deleted));
    source.delete(node.id).expect("delete");

    let report = harness.service.engine().consume().await.expect("consume");
    assert_eq!(report.events, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.deferred, 0);
    assert!(harness.service.store().get(node.id).is_none());
}

/// Store whose first full load blocks until released.
struct GatedStore {
    inner: InMemoryVersionStore,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
    full_loads: AtomicUsize,
}

impl GatedStore {
    fn new(inner: InMemoryVersionStore) -> Self {
        Self {
            inner,
            gated: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            full_loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VersionStore for GatedStore {
    async fn fetch_node(&self, id: NodeId) -> Result<Option<ContentNodeKit>, RepoError> {
        self.inner.fetch_node(id).await
    }

    async fn fetch_descendant_ids(&self, id: NodeId) -> Result<Vec<NodeId>, RepoError> {
        self.inner.fetch_descendant_ids(id).await
    }

    async fn fetch_all_nodes(&self) -> Result<Vec<ContentNodeKit>, RepoError> {
        self.full_loads.fetch_add(1, Ordering::SeqCst);
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch_all_nodes().await
    }
}

#[tokio::test]
async fn concurrent_rebuilds_share_one_load() {
    let inner = InMemoryVersionStore::new();
    let node = inner.create(NewNode::document("Shared")).expect("create");
    inner.publish(node.id).expect("publish");
    let store = Arc::new(GatedStore::new(inner));
    let service = Arc::new(PublishedSnapshotService::new(
        CacheConfig::default(),
        store.clone(),
    ));

    let first = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.rebuild_all().await }
    });
    store.entered.notified().await;
    assert!(service.engine().rebuild_in_progress());

    let refused = service.engine().rebuild_all_exclusive().await;
    assert!(matches!(refused, Err(CacheError::ConcurrentRebuildInProgress)));

    let joined = service.rebuild_all();
    tokio::pin!(joined);
    assert!(futures::poll!(&mut joined).is_pending());

    store.release.notify_one();
    let joined = joined.await.expect("joined rebuild");
    let first = first.await.expect("task").expect("first rebuild");

    assert_eq!(first, joined);
    assert_eq!(store.full_loads.load(Ordering::SeqCst), 1);
    assert!(!service.engine().rebuild_in_progress());
    assert!(published_exists(&service, node.id));
}

fn published_exists(service: &PublishedSnapshotService, id: NodeId) -> bool {
    service.published_snapshot().content().get(id).is_some()
}
