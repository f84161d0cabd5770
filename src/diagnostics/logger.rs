//! Report sinks.
//!
//! The runtime hands rendered error reports and cache statistics to a
//! [`Logger`]. Sinks are best-effort: a failed write is dropped, never
//! surfaced to the instrumented program.

use std::fmt::Write as _;
use std::io::Write as _;

use crate::runtime::AsanErrorInfo;
use crate::sync::mutex::Mutex;

/// Destination for runtime reports.
pub trait Logger: Send + Sync {
    /// Write a block of text.
    fn write(&self, message: &str);

    /// Write `message` followed by one line per frame address.
    fn write_with_stack_trace(&self, message: &str, frames: &[usize]) {
        let mut output = String::from(message);
        append_frames(&mut output, frames);
        self.write(&output);
    }

    /// Persist a snapshot of the process for an error.
    ///
    /// Sinks that cannot capture process state only record that a dump was
    /// requested.
    fn save_mini_dump(&self, error: &AsanErrorInfo) {
        self.write(&format!(
            "minidump requested for {} at 0x{:08x} (no dump writer installed)\n",
            error.error_type,
            error.location
        ));
    }
}

fn append_frames(output: &mut String, frames: &[usize]) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    for (i, frame) in frames.iter().enumerate() {
        let _ = writeln!(output, "    #{} 0x{:08x}", i, frame);
    }
}

/// Forwards reports to the `log` facade under the `shadowheap` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLogger;

impl Logger for LogLogger {
    fn write(&self, message: &str) {
        for line in message.lines() {
            log::error!(target: "shadowheap", "{}", line);
        }
    }
}

/// Writes reports to stderr, one prefixed line at a time.
#[derive(Debug, Clone)]
pub struct StderrLogger {
    prefix: String,
}

impl StderrLogger {
    /// Create a stderr sink with the default `[shadowheap]` prefix.
    pub fn new() -> Self {
        Self::with_prefix("[shadowheap]")
    }

    /// Create a stderr sink with a custom line prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for StderrLogger {
    fn write(&self, message: &str) {
        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        for line in message.lines() {
            let _ = writeln!(stderr, "{} {}", self.prefix, line);
        }
    }
}

/// A sink that keeps every message in memory.
#[derive(Default)]
pub struct CollectingLogger {
    messages: Mutex<Vec<String>>,
    mini_dumps: Mutex<Vec<usize>>,
}

impl CollectingLogger {
    /// Create an empty collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages written so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// All messages concatenated.
    pub fn text(&self) -> String {
        self.messages.lock().concat()
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }

    /// Faulting addresses of the minidumps requested so far.
    pub fn mini_dumps(&self) -> Vec<usize> {
        self.mini_dumps.lock().clone()
    }

    /// Forget everything collected.
    pub fn clear(&self) {
        self.messages.lock().clear();
        self.mini_dumps.lock().clear();
    }
}

impl Logger for CollectingLogger {
    fn write(&self, message: &str) {
        self.messages.lock().push(message.to_owned());
    }

    fn save_mini_dump(&self, error: &AsanErrorInfo) {
        self.mini_dumps.lock().push(error.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_logger() {
        let logger = CollectingLogger::new();
        logger.write("first\n");
        logger.write_with_stack_trace("trace:", &[0x1000, 0x2000]);

        let messages = logger.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], "trace:\n    #0 0x00001000\n    #1 0x00002000\n");
        assert!(logger.contains("first"));

        logger.clear();
        assert!(logger.messages().is_empty());
    }

    #[test]
    fn test_frames_after_newline() {
        let mut output = String::from("freed here:\n");
        append_frames(&mut output, &[0xabc]);
        assert_eq!(output, "freed here:\n    #0 0x00000abc\n");
    }
}
