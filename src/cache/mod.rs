//! NuCache snapshot cache.
//!
//! - **Graph**: immutable, generation-stamped tree of cached nodes
//! - **Store**: lock-free current-graph reference plus a single transactional writer
//! - **Refresh**: change queue, batch planner, incremental refresh, full rebuild
//! - **Published**: lazily built per-culture, per-mode content views
//!
//! ## Configuration
//!
//! Refresh and compression behavior is controlled via `nucache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! consume_on_trigger = true
//! auto_consume_interval_ms = 1000
//! compress_property_aliases = ["bodyText"]
//! # ... see config.rs for all options
//! ```

mod codec;
mod config;
mod error;
mod events;
mod graph;
pub(crate) mod lock;
mod planner;
mod published;
mod refresh;
mod service;
mod snapshot;
mod store;
mod trigger;

pub use codec::{CodecError, CompressionPolicy, PropertyCodec};
pub use config::CacheConfig;
pub use error::CacheError;
pub use events::{ChangeEvent, ChangeTarget, Epoch, EventQueue};
pub use graph::{Ancestors, Children, ContentGraph, GraphBuilder, LoadStats};
pub use planner::{PlannedRefresh, RefreshAction, RefreshPlan};
pub use published::{
    ItemDetails, PublishedChildren, PublishedContent, PublishedContentFactory, PublishedView,
};
pub use refresh::{CacheRefreshEngine, ConsumeReport, RebuildReport};
pub use service::PublishedSnapshotService;
pub use snapshot::{PreviewContext, PublishedCache, Snapshot};
pub use store::{GraphWriter, NodeChange, SnapshotStore};
pub use trigger::CacheTrigger;
