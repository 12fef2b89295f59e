//! Content node records and versions as read from the content store and held in the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{
    path::NodePath,
    types::{ItemKind, NodeId},
};

/// Tree-structural part of a node. Shared by the draft and published views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNodeRecord {
    pub id: NodeId,
    pub key: Uuid,
    pub kind: ItemKind,
    pub parent_id: NodeId,
    pub path: NodePath,
    pub sort_order: i32,
    pub content_type_id: i32,
    pub create_date: OffsetDateTime,
    pub creator_id: i32,
    pub trashed: bool,
}

impl ContentNodeRecord {
    pub fn level(&self) -> usize {
        self.path.level()
    }
}

/// Per-culture name and routing data of a variant version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CultureVariation {
    pub name: String,
    pub url_segment: Option<String>,
    pub date: OffsetDateTime,
    pub is_draft: bool,
}

/// Decoded property value shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Json(serde_json::Value),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// Cached, serialized form of a [`PropertyValue`].
///
/// The `compressed` flag travels with the bytes so decoding never depends on the
/// compression policy that was active when the value was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    pub compressed: bool,
    pub bytes: Vec<u8>,
}

/// One value of a property for a culture and segment. Empty strings mean invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyData<V> {
    #[serde(default)]
    pub culture: String,
    #[serde(default)]
    pub segment: String,
    pub value: V,
}

impl<V> PropertyData<V> {
    pub fn invariant(value: V) -> Self {
        Self {
            culture: String::new(),
            segment: String::new(),
            value,
        }
    }

    pub fn for_culture(culture: impl Into<String>, value: V) -> Self {
        Self {
            culture: culture.into(),
            segment: String::new(),
            value,
        }
    }

    pub fn matches(&self, culture: &str, segment: &str) -> bool {
        self.culture.eq_ignore_ascii_case(culture) && self.segment == segment
    }
}

/// A draft or published version of a node's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
pub struct ContentVersion<V> {
    pub version_id: i32,
    /// False for a retained published version after unpublish, and for drafts.
    pub published: bool,
    pub update_date: OffsetDateTime,
    pub writer_id: i32,
    pub template_id: Option<i32>,
    pub name: String,
    pub url_segment: Option<String>,
    #[serde(default)]
    pub cultures: BTreeMap<String, CultureVariation>,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<PropertyData<V>>>,
}

/// Version as supplied by the content store.
pub type VersionData = ContentVersion<PropertyValue>;

/// Version as held in the cache, with encoded property values.
pub type ContentNodeVersion = ContentVersion<EncodedValue>;

impl<V> ContentVersion<V> {
    pub fn is_variant(&self) -> bool {
        !self.cultures.is_empty()
    }

    /// Maps every property value, keeping all other fields.
    pub fn try_map_values<W, E>(
        &self,
        mut map: impl FnMut(&str, &V) -> Result<W, E>,
    ) -> Result<ContentVersion<W>, E> {
        let mut properties = BTreeMap::new();
        for (alias, values) in &self.properties {
            let mut mapped = Vec::with_capacity(values.len());
            for data in values {
                mapped.push(PropertyData {
                    culture: data.culture.clone(),
                    segment: data.segment.clone(),
                    value: map(alias, &data.value)?,
                });
            }
            properties.insert(alias.clone(), mapped);
        }

        Ok(ContentVersion {
            version_id: self.version_id,
            published: self.published,
            update_date: self.update_date,
            writer_id: self.writer_id,
            template_id: self.template_id,
            name: self.name.clone(),
            url_segment: self.url_segment.clone(),
            cultures: self.cultures.clone(),
            properties,
        })
    }
}

/// Everything the content store returns for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentNodeKit {
    pub node: ContentNodeRecord,
    pub draft: Option<VersionData>,
    pub published: Option<VersionData>,
}

impl ContentNodeKit {
    /// A kit with neither version cannot be cached.
    pub fn is_empty(&self) -> bool {
        self.draft.is_none() && self.published.is_none()
    }
}

/// A cached node: record plus encoded versions, swapped as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    pub record: ContentNodeRecord,
    pub draft: Option<Arc<ContentNodeVersion>>,
    pub published: Option<Arc<ContentNodeVersion>>,
}

impl ContentNode {
    pub fn id(&self) -> NodeId {
        self.record.id
    }

    /// True when the node currently has a live published version.
    pub fn is_published(&self) -> bool {
        self.published.as_ref().is_some_and(|version| version.published)
    }

    /// Version used by preview reads: pending draft, else the published one.
    pub fn preview_version(&self) -> Option<&Arc<ContentNodeVersion>> {
        self.draft.as_ref().or(self.published.as_ref())
    }
}
