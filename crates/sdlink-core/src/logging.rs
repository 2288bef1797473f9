//! Log severities shared by the layers and the adapter's log callback

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::ProtocolError;

/// Severity of a diagnostic message, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogSeverity {
    /// Per-byte and per-frame detail
    Trace = 0,
    /// Retransmissions, discarded frames, state transitions
    Debug = 1,
    /// Lifecycle messages
    #[default]
    Info = 2,
    /// Recoverable protocol errors
    Warning = 3,
    /// Failed operations
    Error = 4,
    /// The link is unusable
    Fatal = 5,
}

impl LogSeverity {
    /// All severities in ascending order
    pub const ALL: [LogSeverity; 6] = [
        LogSeverity::Trace,
        LogSeverity::Debug,
        LogSeverity::Info,
        LogSeverity::Warning,
        LogSeverity::Error,
        LogSeverity::Fatal,
    ];

    /// Forward a message to `tracing` at the matching level
    pub fn trace_message(self, target: &str, message: &str) {
        match self {
            LogSeverity::Trace => tracing::trace!(target: "sdlink", source = target, "{}", message),
            LogSeverity::Debug => tracing::debug!(target: "sdlink", source = target, "{}", message),
            LogSeverity::Info => tracing::info!(target: "sdlink", source = target, "{}", message),
            LogSeverity::Warning => tracing::warn!(target: "sdlink", source = target, "{}", message),
            LogSeverity::Error | LogSeverity::Fatal => {
                tracing::error!(target: "sdlink", source = target, "{}", message)
            }
        }
    }
}

impl TryFrom<u32> for LogSeverity {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        LogSeverity::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ProtocolError::InvalidParam(format!("unknown log severity {}", value)))
    }
}

impl FromStr for LogSeverity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogSeverity::Trace),
            "debug" => Ok(LogSeverity::Debug),
            "info" => Ok(LogSeverity::Info),
            "warning" | "warn" => Ok(LogSeverity::Warning),
            "error" => Ok(LogSeverity::Error),
            "fatal" => Ok(LogSeverity::Fatal),
            other => Err(ProtocolError::InvalidParam(format!(
                "unknown log severity '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogSeverity::Trace => "trace",
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
            LogSeverity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Lowest severity that reaches the log callback, shared across threads
#[derive(Debug)]
pub struct SeverityFilter(AtomicU8);

impl SeverityFilter {
    /// Filter passing `severity` and above
    pub fn new(severity: LogSeverity) -> Self {
        Self(AtomicU8::new(severity as u8))
    }

    /// Current threshold
    pub fn get(&self) -> LogSeverity {
        LogSeverity::ALL
            .get(self.0.load(Ordering::Acquire) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Replace the threshold
    pub fn set(&self, severity: LogSeverity) {
        self.0.store(severity as u8, Ordering::Release);
    }

    /// Whether a message of `severity` passes
    pub fn allows(&self, severity: LogSeverity) -> bool {
        severity >= self.get()
    }
}

impl Default for SeverityFilter {
    fn default() -> Self {
        Self::new(LogSeverity::default())
    }
}
