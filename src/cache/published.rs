//! Published content views built on demand from cached nodes.
//!
//! A [`PublishedContent`] pins the graph generation it was built from, so
//! `parent()` and `children()` resolve against the same snapshot no matter how
//! late they are called.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::domain::entities::{
    ContentNode, ContentNodeRecord, ContentNodeVersion, CultureVariation, PropertyValue,
};
use crate::domain::path::NodePath;
use crate::domain::types::{ItemKind, NodeId};

use super::codec::{CodecError, PropertyCodec};
use super::graph::ContentGraph;

const MEDIA_FILE_ALIAS: &str = "umbracoFile";
const MEMBER_EMAIL_ALIAS: &str = "email";
const MEMBER_LOGIN_ALIAS: &str = "loginName";

/// Builds [`PublishedContent`] views and owns property decoding.
#[derive(Debug, Default)]
pub struct PublishedContentFactory {
    codec: PropertyCodec,
}

impl PublishedContentFactory {
    pub fn new(codec: PropertyCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &PropertyCodec {
        &self.codec
    }

    /// Whether `node` has a view in the given mode.
    ///
    /// A published view needs a live published version on the node and on every
    /// ancestor, and the node must not be in the recycle bin. A preview view
    /// only needs some version.
    pub fn is_visible(graph: &ContentGraph, node: &ContentNode, preview: bool) -> bool {
        if preview {
            return node.preview_version().is_some();
        }
        node.is_published()
            && !node.record.trashed
            && graph
                .ancestors(node.id())
                .all(|ancestor| ancestor.is_published())
    }

    /// Build the view of `node`, or `None` if the requested version does not exist.
    pub fn build(
        self: &Arc<Self>,
        graph: &Arc<ContentGraph>,
        node: &Arc<ContentNode>,
        culture: Option<&str>,
        preview: bool,
    ) -> Option<PublishedContent> {
        if !Self::is_visible(graph, node, preview) {
            return None;
        }

        let version = if preview {
            node.preview_version()
        } else {
            node.published.as_ref()
        }?;

        Some(PublishedContent {
            graph: Arc::clone(graph),
            node: Arc::clone(node),
            version: Arc::clone(version),
            factory: Arc::clone(self),
            preview,
            culture: culture.map(str::to_string),
        })
    }
}

/// Variant-specific data attached to a view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetails {
    Document {
        template_id: Option<i32>,
        url_segment: Option<String>,
    },
    Media {
        file: Option<String>,
    },
    Member {
        email: Option<String>,
        login: Option<String>,
    },
}

/// Read-model view of one node in one version and culture.
#[derive(Clone)]
pub struct PublishedContent {
    graph: Arc<ContentGraph>,
    node: Arc<ContentNode>,
    version: Arc<ContentNodeVersion>,
    factory: Arc<PublishedContentFactory>,
    preview: bool,
    culture: Option<String>,
}

impl std::fmt::Debug for PublishedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedContent")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("preview", &self.preview)
            .field("culture", &self.culture)
            .field("generation", &self.graph.generation())
            .finish()
    }
}

impl PublishedContent {
    pub fn id(&self) -> NodeId {
        self.node.record.id
    }

    pub fn key(&self) -> Uuid {
        self.node.record.key
    }

    pub fn kind(&self) -> ItemKind {
        self.node.record.kind
    }

    pub fn record(&self) -> &ContentNodeRecord {
        &self.node.record
    }

    pub fn path(&self) -> &NodePath {
        &self.node.record.path
    }

    pub fn level(&self) -> usize {
        self.node.record.level()
    }

    pub fn sort_order(&self) -> i32 {
        self.node.record.sort_order
    }

    pub fn trashed(&self) -> bool {
        self.node.record.trashed
    }

    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub fn culture(&self) -> Option<&str> {
        self.culture.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.graph.generation()
    }

    pub fn version_id(&self) -> i32 {
        self.version.version_id
    }

    pub fn writer_id(&self) -> i32 {
        self.version.writer_id
    }

    pub fn template_id(&self) -> Option<i32> {
        self.version.template_id
    }

    /// True when this view shows unpublished edits.
    pub fn is_draft(&self) -> bool {
        if !self.version.published {
            return true;
        }
        self.culture_variation().is_some_and(|variation| variation.is_draft)
    }

    /// Name in the requested culture, falling back to the invariant name.
    pub fn name(&self) -> &str {
        self.culture_variation()
            .map(|variation| variation.name.as_str())
            .unwrap_or(self.version.name.as_str())
    }

    pub fn url_segment(&self) -> Option<&str> {
        self.culture_variation()
            .and_then(|variation| variation.url_segment.as_deref())
            .or(self.version.url_segment.as_deref())
    }

    pub fn update_date(&self) -> OffsetDateTime {
        self.culture_variation()
            .map(|variation| variation.date)
            .unwrap_or(self.version.update_date)
    }

    /// Cultures this version carries data for.
    pub fn cultures(&self) -> impl Iterator<Item = &str> {
        self.version.cultures.keys().map(String::as_str)
    }

    /// Property value in the view's culture, invariant segment.
    pub fn value(&self, alias: &str) -> Option<PropertyValue> {
        self.value_for(alias, self.culture.as_deref(), None)
    }

    /// Property value with explicit culture and segment.
    ///
    /// Lookup order: (culture, segment), (culture, invariant), (invariant,
    /// segment), (invariant, invariant). Undecodable values are logged and
    /// treated as absent.
    pub fn value_for(
        &self,
        alias: &str,
        culture: Option<&str>,
        segment: Option<&str>,
    ) -> Option<PropertyValue> {
        match self.try_value_for(alias, culture, segment) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    node_id = self.id(),
                    alias,
                    error = %err,
                    "Failed to decode cached property value"
                );
                None
            }
        }
    }

    pub fn try_value_for(
        &self,
        alias: &str,
        culture: Option<&str>,
        segment: Option<&str>,
    ) -> Result<Option<PropertyValue>, CodecError> {
        let Some(values) = self.version.properties.get(alias) else {
            return Ok(None);
        };
        let culture = culture.unwrap_or("");
        let segment = segment.unwrap_or("");

        let candidates = [(culture, segment), (culture, ""), ("", segment), ("", "")];
        let found = candidates
            .iter()
            .find_map(|(c, s)| values.iter().find(|data| data.matches(c, s)));

        found
            .map(|data| self.factory.codec().decode(&data.value))
            .transpose()
    }

    /// Every property resolved for the view's culture.
    pub fn values(&self) -> BTreeMap<String, PropertyValue> {
        self.version
            .properties
            .keys()
            .filter_map(|alias| self.value(alias).map(|value| (alias.clone(), value)))
            .collect()
    }

    pub fn details(&self) -> ItemDetails {
        let text = |alias: &str| {
            self.value(alias)
                .and_then(|value| value.as_text().map(str::to_string))
        };
        match self.kind() {
            ItemKind::Document => ItemDetails::Document {
                template_id: self.template_id(),
                url_segment: self.url_segment().map(str::to_string),
            },
            ItemKind::Media => ItemDetails::Media {
                file: text(MEDIA_FILE_ALIAS),
            },
            ItemKind::Member => ItemDetails::Member {
                email: text(MEMBER_EMAIL_ALIAS),
                login: text(MEMBER_LOGIN_ALIAS),
            },
        }
    }

    /// Parent view in the same snapshot, mode, and culture.
    pub fn parent(&self) -> Option<PublishedContent> {
        let parent = self.graph.get(self.node.record.parent_id)?;
        self.factory
            .build(&self.graph, parent, self.culture.as_deref(), self.preview)
    }

    /// Visible children in sort order, built one at a time.
    pub fn children(&self) -> PublishedChildren {
        PublishedChildren::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.factory),
            self.id(),
            None,
            self.preview,
            self.culture.clone(),
        )
    }

    /// Serializable summary of the view.
    pub fn to_view(&self) -> PublishedView {
        PublishedView {
            id: self.id(),
            key: self.key(),
            kind: self.kind(),
            name: self.name().to_string(),
            url_segment: self.url_segment().map(str::to_string),
            path: self.path().to_string(),
            level: self.level(),
            sort_order: self.sort_order(),
            trashed: self.trashed(),
            preview: self.preview,
            draft: self.is_draft(),
            culture: self.culture.clone(),
            generation: self.generation(),
            update_date: self.update_date(),
            details: self.details(),
            values: self.values(),
        }
    }

    fn culture_variation(&self) -> Option<&CultureVariation> {
        let culture = self.culture.as_deref()?;
        self.version
            .cultures
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(culture))
            .map(|(_, variation)| variation)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedView {
    pub id: NodeId,
    pub key: Uuid,
    pub kind: ItemKind,
    pub name: String,
    pub url_segment: Option<String>,
    pub path: String,
    pub level: usize,
    pub sort_order: i32,
    pub trashed: bool,
    pub preview: bool,
    pub draft: bool,
    pub culture: Option<String>,
    pub generation: u64,
    pub update_date: OffsetDateTime,
    pub details: ItemDetails,
    pub values: BTreeMap<String, PropertyValue>,
}

/// Lazy iterator over visible children. Clone it to walk the same children again.
#[derive(Clone)]
pub struct PublishedChildren {
    graph: Arc<ContentGraph>,
    factory: Arc<PublishedContentFactory>,
    parent_id: NodeId,
    kind: Option<ItemKind>,
    next_index: usize,
    preview: bool,
    culture: Option<String>,
}

impl PublishedChildren {
    pub(crate) fn new(
        graph: Arc<ContentGraph>,
        factory: Arc<PublishedContentFactory>,
        parent_id: NodeId,
        kind: Option<ItemKind>,
        preview: bool,
        culture: Option<String>,
    ) -> Self {
        Self {
            graph,
            factory,
            parent_id,
            kind,
            next_index: 0,
            preview,
            culture,
        }
    }
}

impl Iterator for PublishedChildren {
    type Item = PublishedContent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = *self.graph.child_ids(self.parent_id).get(self.next_index)?;
            self.next_index += 1;

            let Some(node) = self.graph.get(id) else {
                continue;
            };
            if node.record.trashed || self.kind.is_some_and(|kind| kind != node.record.kind) {
                continue;
            }
            if let Some(content) =
                self.factory
                    .build(&self.graph, node, self.culture.as_deref(), self.preview)
            {
                return Some(content);
            }
        }
    }
}
