//! Cache configuration.
//!
//! Controls refresh scheduling and property compression via the `[cache]`
//! section of `nucache.toml`.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 500;
const DEFAULT_COMPRESS_MIN_BYTES: usize = 1024;
const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// Cache configuration from `nucache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Accept change notifications. When false, only explicit rebuilds refresh the cache.
    pub enabled: bool,
    /// Consume the queue inline when a change is triggered.
    pub consume_on_trigger: bool,
    /// Background consume interval (ms) when no wake-up arrives.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Property aliases always stored compressed.
    pub compress_property_aliases: BTreeSet<String>,
    /// Values whose encoded size reaches this many bytes are compressed. Zero disables.
    pub compress_min_bytes: usize,
    /// Deflate level, 0-9.
    pub compression_level: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consume_on_trigger: true,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            compress_property_aliases: BTreeSet::new(),
            compress_min_bytes: DEFAULT_COMPRESS_MIN_BYTES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            consume_on_trigger: settings.consume_on_trigger,
            auto_consume_interval_ms: settings.auto_consume_interval.as_millis() as u64,
            consume_batch_limit: settings.consume_batch_limit.get(),
            compress_property_aliases: settings.compress_property_aliases.clone(),
            compress_min_bytes: settings.compress_min_bytes,
            compression_level: settings.compression_level,
        }
    }
}

impl CacheConfig {
    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms.max(1))
    }

    /// Batch limit clamped to at least one event.
    pub fn batch_limit(&self) -> usize {
        self.consume_batch_limit.max(1)
    }

    pub fn compression_enabled(&self) -> bool {
        !self.compress_property_aliases.is_empty() || self.compress_min_bytes > 0
    }
}
