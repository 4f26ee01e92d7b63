//! Settings structs, one per `[section]`.

use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration loaded from an INI file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    /// Dispatcher settings
    pub dispatcher: DispatcherSettings,
    /// Wire client and server settings
    pub wire: WireSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    /// Log contained failures at WARN
    pub warn: bool,
    /// Log every successful call at INFO
    pub spew: bool,
    /// Report failures as text values by default
    pub failure_as_value: bool,
    /// Rest period for a worker after a failed call
    pub recovery_delay: Duration,
}

/// `[wire]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct WireSettings {
    /// Largest result sent in one frame before chunking kicks in
    pub chunk_size: usize,
    /// Pause between reconnection attempts
    pub reconnect_interval: Duration,
    /// Connection attempts before a worker gives up
    pub reconnect_attempts: u32,
    /// Resends of one request after lost connections
    pub resend_attempts: u32,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Directory for the log file; no file logging when unset
    pub directory: Option<PathBuf>,
    /// Log file name inside `directory`
    pub file: String,
}
