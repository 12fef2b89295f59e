//! In-process content store.
//!
//! Backs the cache in tests and in embedded deployments without Postgres. Edits
//! follow the content store's rules: saving creates or updates a draft,
//! publishing promotes it, trashing moves the branch under the kind's recycle
//! bin. Callers notify the cache after each edit, exactly as they would after a
//! committed transaction.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{RepoError, VersionStore, sort_kits};
use crate::cache::lock::mutex_lock;
use crate::domain::entities::{
    ContentNodeKit, ContentNodeRecord, CultureVariation, PropertyData, PropertyValue, VersionData,
};
use crate::domain::path::NodePath;
use crate::domain::types::{ItemKind, NodeId, ROOT_ID};

const SOURCE: &str = "infra::memory";
const DEFAULT_WRITER_ID: i32 = 0;

/// Description of a node to create.
#[derive(Debug, Clone)]
pub struct NewNode {
    kind: ItemKind,
    name: String,
    parent_id: NodeId,
    key: Option<Uuid>,
    content_type_id: i32,
    template_id: Option<i32>,
    cultures: BTreeMap<String, String>,
    properties: BTreeMap<String, Vec<PropertyData<PropertyValue>>>,
}

impl NewNode {
    pub fn new(kind: ItemKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent_id: ROOT_ID,
            key: None,
            content_type_id: 0,
            template_id: None,
            cultures: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn document(name: impl Into<String>) -> Self {
        Self::new(ItemKind::Document, name)
    }

    pub fn media(name: impl Into<String>) -> Self {
        Self::new(ItemKind::Media, name)
    }

    pub fn member(name: impl Into<String>) -> Self {
        Self::new(ItemKind::Member, name)
    }

    pub fn under(mut self, parent_id: NodeId) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_key(mut self, key: Uuid) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_content_type(mut self, content_type_id: i32) -> Self {
        self.content_type_id = content_type_id;
        self
    }

    pub fn with_template(mut self, template_id: i32) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_value(mut self, alias: &str, value: impl Into<PropertyValue>) -> Self {
        upsert_value(&mut self.properties, alias, "", value.into());
        self
    }

    /// Makes the node vary by culture and names it in `culture`.
    pub fn with_culture(mut self, culture: &str, name: impl Into<String>) -> Self {
        self.cultures.insert(culture.to_string(), name.into());
        self
    }

    pub fn with_culture_value(
        mut self,
        culture: &str,
        alias: &str,
        value: impl Into<PropertyValue>,
    ) -> Self {
        upsert_value(&mut self.properties, alias, culture, value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct StoredNode {
    record: ContentNodeRecord,
    draft: Option<VersionData>,
    published: Option<VersionData>,
}

impl StoredNode {
    fn to_kit(&self) -> ContentNodeKit {
        ContentNodeKit {
            node: self.record.clone(),
            draft: self.draft.clone(),
            published: self.published.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: BTreeMap<NodeId, StoredNode>,
    last_id: NodeId,
    last_version: i32,
}

impl StoreState {
    fn next_id(&mut self) -> NodeId {
        self.last_id += 1;
        self.last_id
    }

    fn next_version(&mut self) -> i32 {
        self.last_version += 1;
        self.last_version
    }

    fn node(&self, id: NodeId) -> Result<&StoredNode, RepoError> {
        self.nodes.get(&id).ok_or(RepoError::NotFound)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut StoredNode, RepoError> {
        self.nodes.get_mut(&id).ok_or(RepoError::NotFound)
    }

    /// Path and trashed flag a child of `parent_id` inherits.
    fn placement(&self, parent_id: NodeId) -> Result<(NodePath, bool), RepoError> {
        if parent_id == ROOT_ID {
            return Ok((NodePath::root(), false));
        }
        if is_recycle_bin(parent_id) {
            return Ok((NodePath::root().child(parent_id), true));
        }
        let parent = self
            .nodes
            .get(&parent_id)
            .ok_or_else(|| RepoError::integrity(format!("parent {parent_id} does not exist")))?;
        Ok((parent.record.path.clone(), parent.record.trashed))
    }

    fn next_sort_order(&self, parent_id: NodeId) -> i32 {
        self.nodes
            .values()
            .filter(|node| node.record.parent_id == parent_id)
            .map(|node| node.record.sort_order + 1)
            .max()
            .unwrap_or(0)
    }

    fn descendant_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.record.id != id && node.record.path.contains(id))
            .map(|node| node.record.id)
            .collect()
    }
}

/// [`VersionStore`] held entirely in memory.
pub struct InMemoryVersionStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every read fails with [`RepoError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        mutex_lock(&self.state, SOURCE, "node_ids")
            .nodes
            .keys()
            .copied()
            .collect()
    }

    pub fn record(&self, id: NodeId) -> Result<ContentNodeRecord, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "record");
        Ok(state.node(id)?.record.clone())
    }

    /// Create a node with an unpublished draft.
    pub fn create(&self, new: NewNode) -> Result<ContentNodeRecord, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "create");
        let (parent_path, trashed) = state.placement(new.parent_id)?;
        if let Some(key) = new.key
            && state.nodes.values().any(|node| node.record.key == key)
        {
            return Err(RepoError::integrity(format!("key {key} already in use")));
        }

        let id = state.next_id();
        let now = OffsetDateTime::now_utc();
        let record = ContentNodeRecord {
            id,
            key: new.key.unwrap_or_else(Uuid::new_v4),
            kind: new.kind,
            parent_id: new.parent_id,
            path: parent_path.child(id),
            sort_order: state.next_sort_order(new.parent_id),
            content_type_id: new.content_type_id,
            create_date: now,
            creator_id: DEFAULT_WRITER_ID,
            trashed,
        };
        let cultures = new
            .cultures
            .into_iter()
            .map(|(culture, name)| {
                let variation = CultureVariation {
                    url_segment: Some(url_segment(&name)),
                    name,
                    date: now,
                    is_draft: true,
                };
                (culture, variation)
            })
            .collect();
        let draft = VersionData {
            version_id: state.next_version(),
            published: false,
            update_date: now,
            writer_id: DEFAULT_WRITER_ID,
            template_id: new.template_id,
            url_segment: Some(url_segment(&new.name)),
            name: new.name,
            cultures,
            properties: new.properties,
        };

        state.nodes.insert(
            id,
            StoredNode {
                record: record.clone(),
                draft: Some(draft),
                published: None,
            },
        );
        Ok(record)
    }

    /// Insert a kit exactly as given, bypassing tree validation.
    pub fn insert_raw(&self, kit: ContentNodeKit) {
        let mut state = mutex_lock(&self.state, SOURCE, "insert_raw");
        state.last_id = state.last_id.max(kit.node.id);
        state.nodes.insert(
            kit.node.id,
            StoredNode {
                record: kit.node,
                draft: kit.draft,
                published: kit.published,
            },
        );
    }

    /// Save an edit into the node's draft, starting one from the published version if needed.
    pub fn edit(&self, id: NodeId, change: impl FnOnce(&mut VersionData)) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "edit");
        let version_id = state.next_version();
        let node = state.node_mut(id)?;
        let mut draft = match node.draft.take() {
            Some(draft) => draft,
            None => node
                .published
                .clone()
                .ok_or_else(|| RepoError::integrity(format!("node {id} has no version")))?,
        };

        let now = OffsetDateTime::now_utc();
        draft.version_id = version_id;
        draft.published = false;
        draft.update_date = now;
        change(&mut draft);
        for variation in draft.cultures.values_mut() {
            variation.is_draft = true;
            variation.date = now;
        }
        node.draft = Some(draft);
        Ok(())
    }

    pub fn rename(&self, id: NodeId, name: &str) -> Result<(), RepoError> {
        self.edit(id, |draft| {
            draft.name = name.to_string();
            draft.url_segment = Some(url_segment(name));
        })
    }

    pub fn rename_culture(&self, id: NodeId, culture: &str, name: &str) -> Result<(), RepoError> {
        self.edit(id, |draft| {
            let variation = draft
                .cultures
                .entry(culture.to_string())
                .or_insert_with(|| CultureVariation {
                    name: String::new(),
                    url_segment: None,
                    date: OffsetDateTime::now_utc(),
                    is_draft: true,
                });
            variation.name = name.to_string();
            variation.url_segment = Some(url_segment(name));
        })
    }

    pub fn set_value(
        &self,
        id: NodeId,
        alias: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), RepoError> {
        let value = value.into();
        self.edit(id, |draft| upsert_value(&mut draft.properties, alias, "", value))
    }

    pub fn set_culture_value(
        &self,
        id: NodeId,
        culture: &str,
        alias: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), RepoError> {
        let value = value.into();
        self.edit(id, |draft| {
            upsert_value(&mut draft.properties, alias, culture, value)
        })
    }

    /// Promote the draft, or re-publish a retained version.
    pub fn publish(&self, id: NodeId) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "publish");
        let node = state.node_mut(id)?;
        let mut version = match node.draft.take() {
            Some(draft) => draft,
            None => node
                .published
                .take()
                .ok_or_else(|| RepoError::integrity(format!("node {id} has no version")))?,
        };
        version.published = true;
        for variation in version.cultures.values_mut() {
            variation.is_draft = false;
        }
        node.published = Some(version);
        Ok(())
    }

    /// Take the node offline. The published version is retained, flagged as not live.
    pub fn unpublish(&self, id: NodeId) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "unpublish");
        let node = state.node_mut(id)?;
        if let Some(published) = node.published.as_mut() {
            published.published = false;
        }
        Ok(())
    }

    /// Move a node and its branch under `parent_id`, appended after existing siblings.
    pub fn move_node(&self, id: NodeId, parent_id: NodeId) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "move_node");
        let old_path = state.node(id)?.record.path.clone();
        let (parent_path, trashed) = state.placement(parent_id)?;
        if parent_path.contains(id) {
            return Err(RepoError::integrity(format!(
                "cannot move node {id} below itself"
            )));
        }

        let new_path = parent_path.child(id);
        let sort_order = state.next_sort_order(parent_id);
        let descendants = state.descendant_ids(id);

        let node = state.node_mut(id)?;
        node.record.parent_id = parent_id;
        node.record.path = new_path.clone();
        node.record.sort_order = sort_order;
        node.record.trashed = trashed;

        for descendant in descendants {
            let node = state.node_mut(descendant)?;
            node.record.path = node
                .record
                .path
                .rebase(&old_path, &new_path)
                .ok_or_else(|| RepoError::integrity(format!("node {descendant} left its branch")))?;
            node.record.trashed = trashed;
        }
        Ok(())
    }

    /// Move a node into its kind's recycle bin.
    pub fn trash(&self, id: NodeId) -> Result<(), RepoError> {
        let kind = self.record(id)?.kind;
        let bin = kind.recycle_bin_id().ok_or_else(|| {
            RepoError::integrity(format!("{} items have no recycle bin", kind.as_str()))
        })?;
        self.move_node(id, bin)
    }

    pub fn restore(&self, id: NodeId, parent_id: NodeId) -> Result<(), RepoError> {
        if is_recycle_bin(parent_id) {
            return Err(RepoError::integrity("cannot restore into a recycle bin"));
        }
        self.move_node(id, parent_id)
    }

    /// Delete a node and its branch. Returns the removed ids.
    pub fn delete(&self, id: NodeId) -> Result<Vec<NodeId>, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "delete");
        state.node(id)?;
        let mut removed = vec![id];
        removed.extend(state.descendant_ids(id));
        for node_id in &removed {
            state.nodes.remove(node_id);
        }
        Ok(removed)
    }

    /// Reorder the children of `parent_id`. Children not listed keep their order after them.
    pub fn sort(&self, parent_id: NodeId, ordered: &[NodeId]) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "sort");
        for id in ordered {
            if state.node(*id)?.record.parent_id != parent_id {
                return Err(RepoError::integrity(format!(
                    "node {id} is not a child of {parent_id}"
                )));
            }
        }

        let mut rest: Vec<(i32, NodeId)> = state
            .nodes
            .values()
            .filter(|node| node.record.parent_id == parent_id && !ordered.contains(&node.record.id))
            .map(|node| (node.record.sort_order, node.record.id))
            .collect();
        rest.sort_unstable();

        let sequence = ordered
            .iter()
            .copied()
            .chain(rest.into_iter().map(|(_, id)| id));
        for (index, id) in sequence.enumerate() {
            state.node_mut(id)?.record.sort_order = index as i32;
        }
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), RepoError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepoError::unavailable("in-memory store marked unavailable"))
        }
    }
}

impl Default for InMemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn fetch_node(&self, id: NodeId) -> Result<Option<ContentNodeKit>, RepoError> {
        self.ensure_available()?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_node");
        Ok(state.nodes.get(&id).map(StoredNode::to_kit))
    }

    async fn fetch_descendant_ids(&self, id: NodeId) -> Result<Vec<NodeId>, RepoError> {
        self.ensure_available()?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_descendant_ids");
        Ok(state.descendant_ids(id))
    }

    async fn fetch_branch(&self, id: NodeId) -> Result<Vec<ContentNodeKit>, RepoError> {
        self.ensure_available()?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_branch");
        if !state.nodes.contains_key(&id) {
            return Ok(Vec::new());
        }
        let mut kits: Vec<_> = state
            .nodes
            .values()
            .filter(|node| node.record.path.contains(id))
            .map(StoredNode::to_kit)
            .collect();
        sort_kits(&mut kits);
        Ok(kits)
    }

    async fn fetch_all_nodes(&self) -> Result<Vec<ContentNodeKit>, RepoError> {
        self.ensure_available()?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_all_nodes");
        let mut kits: Vec<_> = state.nodes.values().map(StoredNode::to_kit).collect();
        sort_kits(&mut kits);
        Ok(kits)
    }
}

fn is_recycle_bin(id: NodeId) -> bool {
    [ItemKind::Document, ItemKind::Media]
        .into_iter()
        .any(|kind| kind.recycle_bin_id() == Some(id))
}

fn upsert_value(
    properties: &mut BTreeMap<String, Vec<PropertyData<PropertyValue>>>,
    alias: &str,
    culture: &str,
    value: PropertyValue,
) {
    let values = properties.entry(alias.to_string()).or_default();
    match values.iter_mut().find(|data| data.matches(culture, "")) {
        Some(existing) => existing.value = value,
        None => values.push(PropertyData::for_culture(culture, value)),
    }
}

fn url_segment(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_places_node_under_parent() {
        let store = InMemoryVersionStore::new();
        let home = store.create(NewNode::document("Home")).expect("home");
        let about = store
            .create(NewNode::document("About Us").under(home.id))
            .expect("about");

        assert_eq!(about.path.segments(), &[ROOT_ID, home.id, about.id]);
        let kit = store.fetch_node(about.id).await.expect("fetch").expect("kit");
        let draft = kit.draft.expect("draft");
        assert_eq!(draft.url_segment.as_deref(), Some("about-us"));
        assert!(kit.published.is_none());
    }

    #[test]
    fn create_rejects_missing_parent() {
        let store = InMemoryVersionStore::new();
        let err = store
            .create(NewNode::document("Orphan").under(42))
            .expect_err("missing parent");
        assert!(matches!(err, RepoError::Integrity { .. }));
    }

    #[tokio::test]
    async fn publish_then_edit_keeps_published_version() {
        let store = InMemoryVersionStore::new();
        let home = store
            .create(NewNode::document("Home").with_value("title", "v1"))
            .expect("home");
        store.publish(home.id).expect("publish");
        store.set_value(home.id, "title", "v2").expect("edit");

        let kit = store.fetch_node(home.id).await.expect("fetch").expect("kit");
        let published = kit.published.expect("published");
        let draft = kit.draft.expect("draft");
        assert!(published.published);
        assert!(!draft.published);
        assert_eq!(published.properties["title"][0].value, PropertyValue::from("v1"));
        assert_eq!(draft.properties["title"][0].value, PropertyValue::from("v2"));
        assert!(draft.version_id > published.version_id);
    }

    #[tokio::test]
    async fn unpublish_retains_version() {
        let store = InMemoryVersionStore::new();
        let home = store.create(NewNode::document("Home")).expect("home");
        store.publish(home.id).expect("publish");
        store.unpublish(home.id).expect("unpublish");

        let kit = store.fetch_node(home.id).await.expect("fetch").expect("kit");
        assert!(!kit.published.expect("retained").published);

        store.publish(home.id).expect("republish");
        let kit = store.fetch_node(home.id).await.expect("fetch").expect("kit");
        assert!(kit.published.expect("live").published);
    }

    #[tokio::test]
    async fn trash_moves_branch_into_bin() {
        let store = InMemoryVersionStore::new();
        let home = store.create(NewNode::document("Home")).expect("home");
        let child = store
            .create(NewNode::document("Child").under(home.id))
            .expect("child");

        store.trash(home.id).expect("trash");
        let record = store.record(child.id).expect("child");
        assert!(record.trashed);
        assert_eq!(
            record.path.segments(),
            &[ROOT_ID, crate::domain::types::RECYCLE_BIN_CONTENT_ID, home.id, child.id]
        );

        store.restore(home.id, ROOT_ID).expect("restore");
        assert!(!store.record(child.id).expect("child").trashed);
    }

    #[test]
    fn members_cannot_be_trashed() {
        let store = InMemoryVersionStore::new();
        let member = store.create(NewNode::member("Ann")).expect("member");
        assert!(store.trash(member.id).is_err());
    }

    #[test]
    fn delete_twice_reports_not_found() {
        let store = InMemoryVersionStore::new();
        let home = store.create(NewNode::document("Home")).expect("home");
        let child = store
            .create(NewNode::document("Child").under(home.id))
            .expect("child");

        let removed = store.delete(home.id).expect("delete");
        assert_eq!(removed, vec![home.id, child.id]);
        assert!(matches!(store.delete(home.id), Err(RepoError::NotFound)));
    }

    #[test]
    fn sort_reorders_children() {
        let store = InMemoryVersionStore::new();
        let a = store.create(NewNode::document("A")).expect("a");
        let b = store.create(NewNode::document("B")).expect("b");
        let c = store.create(NewNode::document("C")).expect("c");

        store.sort(ROOT_ID, &[c.id, a.id]).expect("sort");
        assert_eq!(store.record(c.id).expect("c").sort_order, 0);
        assert_eq!(store.record(a.id).expect("a").sort_order, 1);
        assert_eq!(store.record(b.id).expect("b").sort_order, 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_reads() {
        let store = InMemoryVersionStore::new();
        store.set_available(false);
        assert!(matches!(
            store.fetch_all_nodes().await,
            Err(RepoError::Unavailable(_))
        ));
    }
}
