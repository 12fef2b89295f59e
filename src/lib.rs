//! NuCache: snapshot-isolated published-content cache.
//!
//! Readers pin an immutable graph generation through a [`cache::Snapshot`];
//! the refresh engine applies change notifications from the content store and
//! publishes each batch as a new generation.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
