mod common;

use std::sync::Arc;

use common::names;
use nucache::application::repos::VersionStore;
use nucache::cache::{CacheConfig, PublishedSnapshotService};
use nucache::domain::entities::ContentNodeKit;
use nucache::infra::db::PostgresVersionStore;
use nucache::infra::memory::{InMemoryVersionStore, NewNode};
use sqlx::PgPool;
use sqlx::types::Json;

async fn insert_kit(pool: &PgPool, kit: &ContentNodeKit) {
    let node = &kit.node;
    sqlx::query(
        r#"
        INSERT INTO content_nodes
            (id, key, kind, parent_id, path, level, sort_order, content_type_id, create_date, creator_id, trashed)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(node.id)
    .bind(node.key)
    .bind(node.kind)
    .bind(node.parent_id)
    .bind(node.path.to_string())
    .bind(node.level() as i32)
    .bind(node.sort_order)
    .bind(node.content_type_id)
    .bind(node.create_date)
    .bind(node.creator_id)
    .bind(node.trashed)
    .execute(pool)
    .await
    .expect("insert node");

    let versions = [("draft", &kit.draft), ("published", &kit.published)];
    for (state, version) in versions {
        let Some(version) = version else { continue };
        sqlx::query(
            "INSERT INTO content_versions (node_id, state, version_id, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(node.id)
        .bind(state)
        .bind(version.version_id)
        .bind(Json(version))
        .execute(pool)
        .await
        .expect("insert version");
    }
}

/// Seeds `Home > About` (published) and `Drafts` (draft only).
async fn seed(pool: &PgPool) -> (i32, i32, i32) {
    let staging = InMemoryVersionStore::new();
    let home = staging.create(NewNode::document("Home")).expect("home").id;
    let about = staging
        .create(NewNode::document("About").under(home).with_value("title", "About us"))
        .expect("about")
        .id;
    let drafts = staging.create(NewNode::document("Drafts")).expect("drafts").id;
    staging.publish(home).expect("publish");
    staging.publish(about).expect("publish");

    for kit in staging.fetch_all_nodes().await.expect("kits") {
        insert_kit(pool, &kit).await;
    }
    (home, about, drafts)
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a Postgres server"]
async fn postgres_store_reads_nodes_and_branches(pool: PgPool) {
    let (home, about, drafts) = seed(&pool).await;
    let store = PostgresVersionStore::new(pool);
    store.health_check().await.expect("health check");

    let kit = store.fetch_node(about).await.expect("fetch").expect("kit");
    assert_eq!(kit.node.parent_id, home);
    assert!(kit.draft.is_none());
    assert_eq!(kit.published.map(|version| version.name).as_deref(), Some("About"));

    assert!(store.fetch_node(9999).await.expect("fetch").is_none());
    assert_eq!(store.fetch_descendant_ids(home).await.expect("ids"), vec![about]);

    let branch = store.fetch_branch(home).await.expect("branch");
    let ids: Vec<_> = branch.iter().map(|kit| kit.node.id).collect();
    assert_eq!(ids, vec![home, about]);
    assert!(store.fetch_branch(9999).await.expect("branch").is_empty());

    let all = store.fetch_all_nodes().await.expect("all");
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|kit| kit.node.id == drafts && kit.published.is_none()));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a Postgres server"]
async fn cache_refreshes_from_postgres(pool: PgPool) {
    let (home, about, drafts) = seed(&pool).await;
    let store = Arc::new(PostgresVersionStore::new(pool.clone()));
    let service = PublishedSnapshotService::new(CacheConfig::default(), store);

    let report = service.rebuild_all().await.expect("rebuild");
    assert_eq!(report.loaded, 3);
    assert_eq!(report.skipped, 0);

    let snapshot = service.published_snapshot();
    let home_view = snapshot.content().get(home).expect("home");
    assert_eq!(names(home_view.children()), vec!["About"]);
    assert!(snapshot.content().get(drafts).is_none());
    drop(snapshot);

    sqlx::query(
        r#"
        UPDATE content_versions
        SET data = jsonb_set(data, '{name}', '"About the team"')
        WHERE node_id = $1 AND state = 'published'
        "#,
    )
    .bind(about)
    .execute(&pool)
    .await
    .expect("update");

    service.trigger().published(about).await.expect("published");
    let renamed = service
        .published_snapshot()
        .content()
        .get(about)
        .map(|content| content.name().to_string());
    assert_eq!(renamed.as_deref(), Some("About the team"));
}
