//! Application layer: content store ports and error reporting.

pub mod error;
pub mod repos;
