//! Log channels and sinks.
//!
//! The kernel writes to four channels. Where the messages end up is decided
//! by the [`LogSink`] handed to the kernel at construction time; the default
//! [`TracingSink`] forwards everything to `tracing`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Severity channel of a kernel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogChannel {
    /// Failures that abort the current operation.
    Error,
    /// Recoverable problems, e.g. an unsuitable adapter.
    Warn,
    /// Regular progress messages.
    Log,
    /// Fine-grained bring-up steps.
    Graph,
}

impl LogChannel {
    /// Short upper-case tag used when rendering messages.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warn => "Warn",
            Self::Log => "Log",
            Self::Graph => "Graph",
        }
    }
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Destination for kernel messages.
///
/// Sinks are shared between the render thread and the window thread, so
/// implementations must be `Send + Sync`.
pub trait LogSink: Send + Sync {
    /// Write one message to the given channel.
    fn write(&self, channel: LogChannel, message: &str);

    fn error(&self, message: &str) {
        self.write(LogChannel::Error, message);
    }

    fn warn(&self, message: &str) {
        self.write(LogChannel::Warn, message);
    }

    fn log(&self, message: &str) {
        self.write(LogChannel::Log, message);
    }

    fn graph(&self, message: &str) {
        self.write(LogChannel::Graph, message);
    }
}

/// Forwards kernel messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, channel: LogChannel, message: &str) {
        match channel {
            LogChannel::Error => tracing::error!(channel = %channel, "{message}"),
            LogChannel::Warn => tracing::warn!(channel = %channel, "{message}"),
            LogChannel::Log => tracing::info!(channel = %channel, "{message}"),
            LogChannel::Graph => tracing::debug!(channel = %channel, "{message}"),
        }
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _channel: LogChannel, _message: &str) {}
}

/// Keeps messages in memory.
///
/// Useful for in-application consoles and for asserting on kernel output.
#[derive(Debug, Default)]
pub struct CaptureSink {
    entries: Mutex<Vec<(LogChannel, String)>>,
}

impl CaptureSink {
    /// Create an empty sink wrapped in an `Arc`, ready to be shared.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all captured messages in arrival order.
    pub fn entries(&self) -> Vec<(LogChannel, String)> {
        self.entries.lock().clone()
    }

    /// Messages captured on one channel.
    pub fn messages(&self, channel: LogChannel) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of captured messages containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, m)| m.contains(needle))
            .count()
    }

    /// Drop everything captured so far.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl LogSink for CaptureSink {
    fn write(&self, channel: LogChannel, message: &str) {
        self.entries.lock().push((channel, message.to_owned()));
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_sink_keeps_order_and_channel() {
        let sink = CaptureSink::default();
        sink.graph("create instance");
        sink.error("instance failed");
        sink.log("done");

        let entries = sink.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, LogChannel::Graph);
        assert_eq!(entries[1], (LogChannel::Error, "instance failed".to_string()));
        assert_eq!(sink.messages(LogChannel::Log), vec!["done".to_string()]);
    }

    #[test]
    fn count_containing_matches_substrings() {
        let sink = CaptureSink::default();
        sink.log("window has been collapsed");
        sink.log("window has been expanded");
        sink.warn("adapter isn't suitable");

        assert_eq!(sink.count_containing("window has been"), 2);
        assert_eq!(sink.count_containing("collapsed"), 1);

        sink.clear();
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn tracing_installs_once() {
        NullSink.error("dropped");
        let first = init_tracing();
        assert!(!init_tracing() || !first);
    }

    #[test]
    fn channel_tags() {
        assert_eq!(LogChannel::Error.to_string(), "Error");
        assert_eq!(LogChannel::Graph.tag(), "Graph");
    }
}
