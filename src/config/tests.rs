use std::io::Write;

use super::*;
use crate::cache::CacheConfig;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("postgres://from-file".to_string());
    raw.logging.level = Some("info".to_string());

    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: Some("debug".to_string()),
        ..Default::default()
    });
    raw.apply_database_override(&DatabaseOverride {
        database_url: Some("postgres://from-cli".to_string()),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(
        settings.database.url.as_deref(),
        Some("postgres://from-cli")
    );
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert!(settings.database.url.is_none());
    assert_eq!(
        settings.database.max_connections.get(),
        DEFAULT_DB_MAX_CONNECTIONS
    );
    assert!(settings.cache.enabled);
    assert!(settings.cache.consume_on_trigger);
    assert_eq!(
        settings.cache.auto_consume_interval,
        Duration::from_millis(DEFAULT_AUTO_CONSUME_INTERVAL_MS)
    );
    assert_eq!(settings.cache.consume_batch_limit.get(), 500);
}

#[test]
fn blank_database_url_is_treated_as_missing() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn zero_batch_limit_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.consume_batch_limit = Some(0);

    let err = Settings::from_raw(raw).expect_err("invalid settings");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.consume_batch_limit",
            ..
        }
    ));
}

#[test]
fn compression_level_is_bounded() {
    let mut raw = RawSettings::default();
    raw.cache.compression_level = Some(12);

    let err = Settings::from_raw(raw).expect_err("invalid settings");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.compression_level",
            ..
        }
    ));
}

#[test]
fn watch_cache_overrides_apply() {
    let mut raw = RawSettings::default();
    raw.apply_cache_overrides(&CacheOverrides {
        auto_consume_interval_ms: Some(250),
        consume_batch_limit: Some(32),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(
        settings.cache.auto_consume_interval,
        Duration::from_millis(250)
    );
    assert_eq!(settings.cache.consume_batch_limit.get(), 32);
}

#[test]
fn config_file_layers_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    writeln!(
        file,
        r#"
[logging]
level = "warn"

[database]
url = "postgres://file"
max_connections = 12

[cache]
consume_on_trigger = false
compress_property_aliases = ["bodyText", "  summary "]
compress_min_bytes = 0
"#
    )
    .expect("write config");

    let path = file.path().to_string_lossy().to_string();
    let args = CliArgs::parse_from([
        "nucache",
        "--config-file",
        path.as_str(),
        "rebuild",
        "--database-url",
        "postgres://cli",
    ]);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.database.url.as_deref(), Some("postgres://cli"));
    assert_eq!(settings.database.max_connections.get(), 12);
    assert!(!settings.cache.consume_on_trigger);
    assert!(settings.cache.compress_property_aliases.contains("summary"));

    let cache = CacheConfig::from(&settings.cache);
    assert!(cache.compression_enabled());
    assert_eq!(cache.compress_min_bytes, 0);
    assert!(!cache.consume_on_trigger);
}

#[test]
fn parse_inspect_arguments() {
    let args = CliArgs::parse_from([
        "nucache",
        "inspect",
        "1052",
        "--preview",
        "--culture",
        "en-US",
        "--children",
        "--log-json",
        "true",
    ]);

    assert_eq!(args.logging.log_json, Some(true));
    match args.command {
        Command::Inspect(inspect) => {
            assert_eq!(inspect.node, NodeRef::Id(1052));
            assert!(inspect.preview);
            assert!(inspect.children);
            assert_eq!(inspect.culture.as_deref(), Some("en-US"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn inspect_accepts_node_keys() {
    let args = CliArgs::parse_from([
        "nucache",
        "inspect",
        "6f1a3c52-4b1e-4c39-9c59-5e0d8f7f2a10",
    ]);

    match args.command {
        Command::Inspect(inspect) => assert!(matches!(inspect.node, NodeRef::Key(_))),
        other => panic!("unexpected command: {other:?}"),
    }
}
