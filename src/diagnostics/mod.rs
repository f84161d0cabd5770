//! Report sinks.
//!
//! The runtime renders every error report to a [`Logger`]. The crate's own
//! operational messages go through the `log` facade instead.

mod logger;

pub use logger::{CollectingLogger, LogLogger, Logger, StderrLogger};
