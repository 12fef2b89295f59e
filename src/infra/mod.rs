//! Infrastructure adapters: content stores, change listener, telemetry.

pub mod db;
pub mod error;
pub mod memory;
pub mod telemetry;
