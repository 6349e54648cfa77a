//! Injected diagnostics reporting.
//!
//! Configuration defects, expression failures and illegal state-machine
//! operations are reported through a `DiagnosticsSink` handed to each
//! subsystem at construction, never through a global logger.
//! [`LogSink`] forwards to the `log` facade; [`MemorySink`] records
//! diagnostics for assertions in tests.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Severity of a reported diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Warning => f.write_str("warning"),
            Level::Error => f.write_str("error"),
        }
    }
}

/// Destination for diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, level: Level, message: &str);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn report(&self, level: Level, message: &str) {
        match level {
            Level::Warning => log::warn!("{message}"),
            Level::Error => log::error!("{message}"),
        }
    }
}

/// Records every diagnostic in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded diagnostics, in report order.
    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded diagnostics whose message contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, msg)| msg.contains(needle))
            .count()
    }
}

impl DiagnosticsSink for MemorySink {
    fn report(&self, level: Level, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }
}

struct Inner {
    sink: Arc<dyn DiagnosticsSink>,
    seen: Mutex<HashSet<String>>,
}

/// Cheaply cloneable handle to a sink, with once-only reporting.
#[derive(Clone)]
pub struct Diagnostics {
    inner: Arc<Inner>,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                seen: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// A handle backed by [`LogSink`].
    pub fn log() -> Self {
        Self::new(Arc::new(LogSink))
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.inner.sink.report(Level::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.inner.sink.report(Level::Error, message.as_ref());
    }

    /// Report a warning unless the exact same message was reported before.
    pub fn warn_once(&self, message: impl AsRef<str>) {
        if self.first_time(message.as_ref()) {
            self.warn(message);
        }
    }

    /// Report an error unless the exact same message was reported before.
    pub fn error_once(&self, message: impl AsRef<str>) {
        if self.first_time(message.as_ref()) {
            self.error(message);
        }
    }

    fn first_time(&self, message: &str) -> bool {
        self.inner
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.to_string())
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::log()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}
