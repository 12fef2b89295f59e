use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{RepoError, VersionStore, sort_kits},
    domain::entities::{ContentNodeKit, ContentNodeRecord, VersionData},
    domain::types::{ItemKind, NodeId},
};

use super::{PostgresVersionStore, map_sqlx_error};

const NODE_COLUMNS: &str = "id, key, kind, parent_id, path, sort_order, content_type_id, \
    create_date, creator_id, trashed";

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: i32,
    key: Uuid,
    kind: ItemKind,
    parent_id: i32,
    path: String,
    sort_order: i32,
    content_type_id: i32,
    create_date: OffsetDateTime,
    creator_id: i32,
    trashed: bool,
}

impl TryFrom<NodeRow> for ContentNodeRecord {
    type Error = RepoError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let path = row.path.parse().map_err(|err| {
            RepoError::integrity(format!("node {} has malformed path: {err}", row.id))
        })?;
        Ok(Self {
            id: row.id,
            key: row.key,
            kind: row.kind,
            parent_id: row.parent_id,
            path,
            sort_order: row.sort_order,
            content_type_id: row.content_type_id,
            create_date: row.create_date,
            creator_id: row.creator_id,
            trashed: row.trashed,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    node_id: i32,
    state: String,
    data: Json<VersionData>,
}

#[derive(Default)]
struct VersionPair {
    draft: Option<VersionData>,
    published: Option<VersionData>,
}

/// Joins node rows with their version rows, keeping node order.
fn assemble(nodes: Vec<NodeRow>, versions: Vec<VersionRow>) -> Result<Vec<ContentNodeKit>, RepoError> {
    let mut pairs: HashMap<NodeId, VersionPair> = HashMap::new();
    for row in versions {
        let pair = pairs.entry(row.node_id).or_default();
        match row.state.as_str() {
            "draft" => pair.draft = Some(row.data.0),
            "published" => pair.published = Some(row.data.0),
            other => {
                return Err(RepoError::integrity(format!(
                    "node {} has version in unknown state `{other}`",
                    row.node_id
                )));
            }
        }
    }

    nodes
        .into_iter()
        .map(|row| {
            let pair = pairs.remove(&row.id).unwrap_or_default();
            Ok(ContentNodeKit {
                node: ContentNodeRecord::try_from(row)?,
                draft: pair.draft,
                published: pair.published,
            })
        })
        .collect()
}

fn descendant_pattern(id: NodeId) -> String {
    format!("%,{id},%")
}

#[async_trait]
impl VersionStore for PostgresVersionStore {
    async fn fetch_node(&self, id: NodeId) -> Result<Option<ContentNodeKit>, RepoError> {
        let node = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let Some(node) = node else {
            return Ok(None);
        };

        let versions = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT node_id, state, data
            FROM content_versions
            WHERE node_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(assemble(vec![node], versions)?.pop())
    }

    async fn fetch_descendant_ids(&self, id: NodeId) -> Result<Vec<NodeId>, RepoError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            SELECT id
            FROM content_nodes
            WHERE path LIKE $1
            ORDER BY level, parent_id, sort_order, id
            "#,
        )
        .bind(descendant_pattern(id))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn fetch_branch(&self, id: NodeId) -> Result<Vec<ContentNodeKit>, RepoError> {
        let mut tx = self
            .begin_consistent_read()
            .await
            .map_err(map_sqlx_error)?;

        let nodes = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes WHERE id = $1 OR path LIKE $2"
        ))
        .bind(id)
        .bind(descendant_pattern(id))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if !nodes.iter().any(|row| row.id == id) {
            return Ok(Vec::new());
        }

        let ids: Vec<i32> = nodes.iter().map(|row| row.id).collect();
        let versions = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT node_id, state, data
            FROM content_versions
            WHERE node_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let mut kits = assemble(nodes, versions)?;
        sort_kits(&mut kits);
        Ok(kits)
    }

    async fn fetch_all_nodes(&self) -> Result<Vec<ContentNodeKit>, RepoError> {
        let mut tx = self
            .begin_consistent_read()
            .await
            .map_err(map_sqlx_error)?;

        let nodes = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes ORDER BY level, parent_id, sort_order, id"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let versions = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT node_id, state, data
            FROM content_versions
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        assemble(nodes, versions)
    }
}
