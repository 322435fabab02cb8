//! Leveled logging capability.
//!
//! Every component in this crate logs through an [`Arc<dyn Logger>`] rather than calling a
//! logging facade directly, so callers can plug in their own sink. [`TracingLogger`] is the
//! default: it applies a threshold and, with the `tracing` feature, forwards to [`tracing`].

use std::sync::Arc;

use serde_json::Value;

/// Severity of a log record, ordered from least to most severe.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A sink for leveled log records.
///
/// Implementations must be cheap to call and must never panic; the connection manager and the
/// router call into the logger from their hot paths.
pub trait Logger: Send + Sync + 'static {
    /// Record `message` at `level` with optional structured `context`.
    fn log(&self, level: Level, message: &str, context: Option<&Value>);

    fn debug(&self, message: &str, context: Option<&Value>) {
        self.log(Level::Debug, message, context);
    }

    fn info(&self, message: &str, context: Option<&Value>) {
        self.log(Level::Info, message, context);
    }

    fn warn(&self, message: &str, context: Option<&Value>) {
        self.log(Level::Warn, message, context);
    }

    fn error(&self, message: &str, context: Option<&Value>) {
        self.log(Level::Error, message, context);
    }
}

/// Default logger: drops records below `threshold`, forwards the rest to `tracing`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    pub threshold: Level,
}

impl TracingLogger {
    #[must_use]
    pub const fn new(threshold: Level) -> Self {
        Self { threshold }
    }

    /// Whether a record at `level` passes the threshold.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level >= self.threshold
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(Level::Debug)
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str, context: Option<&Value>) {
        if !self.enabled(level) {
            return;
        }

        #[cfg(feature = "tracing")]
        {
            let context = context.map(ToString::to_string).unwrap_or_default();
            match level {
                Level::Debug => tracing::debug!(%context, "{message}"),
                Level::Info => tracing::info!(%context, "{message}"),
                Level::Warn => tracing::warn!(%context, "{message}"),
                Level::Error => tracing::error!(%context, "{message}"),
            }
        }
        #[cfg(not(feature = "tracing"))]
        {
            _ = (message, context);
        }
    }
}

/// Logger that discards everything.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _message: &str, _context: Option<&Value>) {}
}

/// The logger used when the caller does not supply one.
#[must_use]
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger::default())
}
