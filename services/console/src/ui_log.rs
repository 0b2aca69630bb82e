//! User-facing log fanout.
//!
//! Formats timestamped entries, prints them through tracing, and broadcasts
//! them to the presentation loop as [`ConsoleUiEvent::LogEntry`] so the UI
//! can show a live activity feed without scraping process logs.

use crate::ui_events::{ConsoleUiEvent, UiSender};
use std::fmt::Display;

/// Severity for UI log entries.  Maps onto the matching tracing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A logger handle cloned into every worker.
#[derive(Clone)]
pub struct UiLogger {
    tx: UiSender,
}

impl UiLogger {
    pub fn new(tx: UiSender) -> Self {
        Self { tx }
    }

    /// Log at info level.
    pub fn log(&self, msg: impl Display) {
        self.log_at(UiLogLevel::Info, msg);
    }

    /// Format a timestamped entry, print to tracing, and broadcast.
    pub fn log_at(&self, level: UiLogLevel, msg: impl Display) {
        let entry = format!("{} {}", chrono::Local::now().format("%H:%M:%S"), msg);
        match level {
            UiLogLevel::Debug => tracing::debug!("{}", entry),
            UiLogLevel::Info => tracing::info!("{}", entry),
            UiLogLevel::Warn => tracing::warn!("{}", entry),
            UiLogLevel::Error => tracing::error!("{}", entry),
        }
        let _ = self.tx.send(ConsoleUiEvent::LogEntry { entry });
    }
}
