//! Debug utilities for inspecting heap blocks.
//!
//! Only compiled when the `debug` feature is enabled.

pub mod poison;
