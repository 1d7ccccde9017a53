// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Diagnostic Logging
//!
//! Components never log through a global. Each one receives an `Arc<dyn Logger>`
//! at construction, which is either the silent [`NoLogger`] or the
//! [`TracingLogger`] that forwards to `tracing`.

use std::fmt;
use tracing::Level;

/// Capability for formatted diagnostic output.
///
/// Implementations must be safe to call from many tasks at once.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::DEBUG, args)
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::INFO, args)
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::WARN, args)
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::ERROR, args)
    }
}

/// Discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLogger;

impl Logger for NoLogger {
    fn log(&self, _level: Level, _args: fmt::Arguments<'_>) {}
}

/// Emits every message as a `tracing` event under the `rabbitmq` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!(target: "rabbitmq", "{}", args),
            Level::WARN => tracing::warn!(target: "rabbitmq", "{}", args),
            Level::INFO => tracing::info!(target: "rabbitmq", "{}", args),
            Level::DEBUG => tracing::debug!(target: "rabbitmq", "{}", args),
            _ => tracing::trace!(target: "rabbitmq", "{}", args),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every line so tests can assert on what was reported.
    #[derive(Default)]
    pub(crate) struct RecordingLogger {
        pub(crate) lines: Mutex<Vec<(Level, String)>>,
    }

    impl RecordingLogger {
        pub(crate) fn contains(&self, needle: &str) -> bool {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .any(|(_, line)| line.contains(needle))
        }
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: Level, args: fmt::Arguments<'_>) {
            self.lines.lock().unwrap().push((level, args.to_string()));
        }
    }

    #[test]
    fn helpers_forward_their_level() {
        let logger = RecordingLogger::default();
        logger.warn(format_args!("can't ack message: {}", 7));
        logger.error(format_args!("boom"));

        let lines = logger.lines.lock().unwrap();
        assert_eq!(lines[0], (Level::WARN, "can't ack message: 7".to_owned()));
        assert_eq!(lines[1].0, Level::ERROR);
    }

    #[test]
    fn no_logger_is_silent() {
        NoLogger.info(format_args!("nothing to see"));
        TracingLogger.debug(format_args!("no subscriber installed"));
    }
}
