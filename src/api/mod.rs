//! Configuration and statistics.

pub mod config;
pub mod stats;
