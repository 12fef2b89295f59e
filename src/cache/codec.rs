//! Property value encoding for cached versions.
//!
//! Values are serialized to JSON and optionally deflated. Each encoded value
//! records whether it was compressed, so any policy can decode any value.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;

use crate::domain::entities::{
    ContentNode, ContentNodeKit, ContentNodeVersion, EncodedValue, PropertyValue, VersionData,
};

use super::config::CacheConfig;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("failed to serialize property `{alias}`: {message}")]
    Serialize { alias: String, message: String },
    #[error("failed to deserialize property value: {message}")]
    Deserialize { message: String },
    #[error("deflate stream error: {message}")]
    Compression { message: String },
}

/// When property values are stored compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionPolicy {
    Disabled,
    Deflate {
        /// Aliases compressed regardless of size.
        aliases: BTreeSet<String>,
        /// Values at least this large are compressed. Zero means aliases only.
        min_bytes: usize,
        level: u32,
    },
}

impl CompressionPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.compression_enabled() {
            return CompressionPolicy::Disabled;
        }
        CompressionPolicy::Deflate {
            aliases: config.compress_property_aliases.clone(),
            min_bytes: config.compress_min_bytes,
            level: config.compression_level.min(9),
        }
    }

    fn level_for(&self, alias: &str, len: usize) -> Option<u32> {
        match self {
            CompressionPolicy::Disabled => None,
            CompressionPolicy::Deflate {
                aliases,
                min_bytes,
                level,
            } => {
                let by_size = *min_bytes > 0 && len >= *min_bytes;
                (aliases.contains(alias) || by_size).then_some(*level)
            }
        }
    }
}

/// Encodes and decodes property values under a [`CompressionPolicy`].
#[derive(Debug, Clone)]
pub struct PropertyCodec {
    policy: CompressionPolicy,
}

impl PropertyCodec {
    pub fn new(policy: CompressionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    pub fn encode(&self, alias: &str, value: &PropertyValue) -> Result<EncodedValue, CodecError> {
        let json = serde_json::to_vec(value).map_err(|err| CodecError::Serialize {
            alias: alias.to_string(),
            message: err.to_string(),
        })?;

        match self.policy.level_for(alias, json.len()) {
            Some(level) => Ok(EncodedValue {
                compressed: true,
                bytes: deflate(&json, level)?,
            }),
            None => Ok(EncodedValue {
                compressed: false,
                bytes: json,
            }),
        }
    }

    pub fn decode(&self, encoded: &EncodedValue) -> Result<PropertyValue, CodecError> {
        let inflated;
        let json = if encoded.compressed {
            inflated = inflate(&encoded.bytes)?;
            inflated.as_slice()
        } else {
            encoded.bytes.as_slice()
        };

        serde_json::from_slice(json).map_err(|err| CodecError::Deserialize {
            message: err.to_string(),
        })
    }

    pub fn encode_version(&self, version: &VersionData) -> Result<ContentNodeVersion, CodecError> {
        version.try_map_values(|alias, value| self.encode(alias, value))
    }

    pub fn decode_version(&self, version: &ContentNodeVersion) -> Result<VersionData, CodecError> {
        version.try_map_values(|_, value| self.decode(value))
    }

    /// Turns a fetched kit into a cacheable node, encoding both versions.
    pub fn build_node(&self, kit: &ContentNodeKit) -> Result<ContentNode, CodecError> {
        let draft = kit
            .draft
            .as_ref()
            .map(|version| self.encode_version(version).map(Arc::new))
            .transpose()?;
        let published = kit
            .published
            .as_ref()
            .map(|version| self.encode_version(version).map(Arc::new))
            .transpose()?;

        Ok(ContentNode {
            record: kit.node.clone(),
            draft,
            published,
        })
    }
}

impl Default for PropertyCodec {
    fn default() -> Self {
        Self::new(CompressionPolicy::Disabled)
    }
}

fn deflate(bytes: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .map_err(|err| CodecError::Compression {
            message: err.to_string(),
        })
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| CodecError::Compression {
            message: err.to_string(),
        })?;
    Ok(out)
}
