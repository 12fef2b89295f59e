//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeSet,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::types::NodeRef;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "nucache";
const ENV_PREFIX: &str = "NUCACHE";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 500;
const DEFAULT_COMPRESS_MIN_BYTES: usize = 1024;
const DEFAULT_COMPRESSION_LEVEL: u32 = 1;
const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Command-line arguments for the NuCache binary.
#[derive(Debug, Parser)]
#[command(name = "nucache", version, about = "Published content snapshot cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "NUCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Load every node from the content store and report what was cached.
    Rebuild(RebuildArgs),
    /// Rebuild, then print one node's view as JSON.
    Inspect(InspectArgs),
    /// Keep the cache current from database change notifications until interrupted.
    Watch(WatchArgs),
    /// Apply the content store schema migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RebuildArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Node id or key.
    #[arg(value_name = "NODE")]
    pub node: NodeRef,

    /// Show the draft view instead of the published one.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub preview: bool,

    /// Culture to resolve names and values for.
    #[arg(long, value_name = "CULTURE")]
    pub culture: Option<String>,

    /// Also print the node's visible children.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub children: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the background consume interval.
    #[arg(long = "cache-auto-consume-interval-ms", value_name = "MILLISECONDS")]
    pub auto_consume_interval_ms: Option<u64>,

    /// Override the maximum number of events per consumption batch.
    #[arg(long = "cache-consume-batch-limit", value_name = "COUNT")]
    pub consume_batch_limit: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub consume_on_trigger: bool,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
    pub compress_property_aliases: BTreeSet<String>,
    pub compress_min_bytes: usize,
    pub compression_level: u32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.compress_property_aliases")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match &cli.command {
        Command::Rebuild(args) => raw.apply_database_override(&args.database),
        Command::Inspect(args) => raw.apply_database_override(&args.database),
        Command::Watch(args) => {
            raw.apply_database_override(&args.database);
            raw.apply_cache_overrides(&args.cache);
        }
        Command::Migrate(args) => raw.apply_database_override(&args.database),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(interval) = overrides.auto_consume_interval_ms {
            self.cache.auto_consume_interval_ms = Some(interval);
        }
        if let Some(limit) = overrides.consume_batch_limit {
            self.cache.consume_batch_limit = Some(limit);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            database,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(DEFAULT_AUTO_CONSUME_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    let batch_limit = cache
        .consume_batch_limit
        .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT);
    let consume_batch_limit = usize::try_from(batch_limit)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "cache.consume_batch_limit",
                "must be greater than zero and fit in usize",
            )
        })?;

    let compression_level = cache.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if compression_level > MAX_COMPRESSION_LEVEL {
        return Err(LoadError::invalid(
            "cache.compression_level",
            format!("must be between 0 and {MAX_COMPRESSION_LEVEL}"),
        ));
    }

    let mut compress_property_aliases = BTreeSet::new();
    for alias in cache.compress_property_aliases.unwrap_or_default() {
        let trimmed = alias.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "cache.compress_property_aliases",
                "aliases must not be empty",
            ));
        }
        compress_property_aliases.insert(trimmed.to_string());
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        consume_on_trigger: cache.consume_on_trigger.unwrap_or(true),
        auto_consume_interval: Duration::from_millis(interval_ms),
        consume_batch_limit,
        compress_property_aliases,
        compress_min_bytes: cache.compress_min_bytes.unwrap_or(DEFAULT_COMPRESS_MIN_BYTES),
        compression_level,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    consume_on_trigger: Option<bool>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
    compress_property_aliases: Option<Vec<String>>,
    compress_min_bytes: Option<usize>,
    compression_level: Option<u32>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
