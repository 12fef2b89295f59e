use std::{process, sync::Arc};

use nucache::{
    application::error::AppError,
    cache::{CacheConfig, PreviewContext, PublishedContent, PublishedSnapshotService},
    config::{self, Command, InspectArgs},
    infra::{
        db::{ChangeListener, PostgresVersionStore},
        error::InfraError,
        telemetry,
    },
};
use serde_json::json;
use sqlx::postgres::PgPool;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        Command::Migrate(_) => run_migrate(&settings).await,
        Command::Rebuild(_) => run_rebuild(&settings).await,
        Command::Inspect(args) => run_inspect(&settings, args).await,
        Command::Watch(_) => run_watch(&settings).await,
    }
}

async fn connect(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    PostgresVersionStore::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))
}

async fn load_service(
    settings: &config::Settings,
    pool: PgPool,
) -> Result<PublishedSnapshotService, AppError> {
    let source = Arc::new(PostgresVersionStore::new(pool));
    let service = PublishedSnapshotService::new(CacheConfig::from(&settings.cache), source);
    let report = service.rebuild_all().await?;
    info!(
        generation = report.generation,
        loaded = report.loaded,
        skipped = report.skipped,
        repaired_paths = report.repaired_paths,
        elapsed_ms = report.elapsed_ms,
        "Cache loaded"
    );
    Ok(service)
}

async fn run_migrate(settings: &config::Settings) -> Result<(), AppError> {
    let pool = connect(settings).await?;
    PostgresVersionStore::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    info!("Migrations applied");
    Ok(())
}

async fn run_rebuild(settings: &config::Settings) -> Result<(), AppError> {
    let pool = connect(settings).await?;
    let service = load_service(settings, pool).await?;
    let snapshot = service.published_snapshot();
    let summary = json!({
        "generation": snapshot.generation(),
        "nodes": snapshot.graph().len(),
        "documents_published": snapshot.content().at_root(false).count(),
        "media_published": snapshot.media().at_root(false).count(),
    });
    print_json(&summary)
}

async fn run_inspect(settings: &config::Settings, args: InspectArgs) -> Result<(), AppError> {
    let pool = connect(settings).await?;
    let service = load_service(settings, pool).await?;

    let mut context = if args.preview {
        PreviewContext::preview()
    } else {
        PreviewContext::published()
    };
    if let Some(culture) = args.culture {
        context = context.with_culture(culture);
    }
    let snapshot = service.create_snapshot(context);

    let kind = snapshot
        .get(args.node)
        .map(|record| record.kind)
        .ok_or(AppError::NotFound)?;
    let content = snapshot.cache(kind).get(args.node).ok_or(AppError::NotFound)?;

    let mut view = serde_json::to_value(content.to_view())
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    if args.children {
        let children: Vec<_> = content.children().map(|child| summary(&child)).collect();
        view["children"] = json!(children);
    }
    print_json(&view)
}

async fn run_watch(settings: &config::Settings) -> Result<(), AppError> {
    let pool = connect(settings).await?;
    let service = load_service(settings, pool.clone()).await?;
    let consumer = service.spawn_auto_consume();
    let listener = ChangeListener::connect(&pool, Arc::clone(service.trigger())).await?;

    let outcome = tokio::select! {
        result = listener.run() => result.map_err(AppError::from),
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            signal.map_err(|err| AppError::from(InfraError::from(err)))
        }
    };

    consumer.abort();
    info!(
        generation = service.generation(),
        live_snapshots = service.live_snapshots(),
        "Watch stopped"
    );
    outcome
}

fn summary(content: &PublishedContent) -> serde_json::Value {
    json!({
        "id": content.id(),
        "key": content.key(),
        "name": content.name(),
        "sort_order": content.sort_order(),
    })
}

fn print_json(value: &serde_json::Value) -> Result<(), AppError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}
