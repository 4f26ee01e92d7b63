//! Default values for every setting.

use super::settings::*;
use crate::dispatch::{DEFAULT_RECOVERY_DELAY, DEFAULT_SPEW, DEFAULT_WARN};
use crate::wire::{
    DEFAULT_CHUNK_SIZE, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_RESEND_ATTEMPTS,
};

/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log file name.
pub const DEFAULT_LOG_FILE: &str = "taskwire.log";

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            warn: DEFAULT_WARN,
            spew: DEFAULT_SPEW,
            failure_as_value: false,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
        }
    }
}

impl Default for WireSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            resend_attempts: DEFAULT_RESEND_ATTEMPTS,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
            file: DEFAULT_LOG_FILE.to_string(),
        }
    }
}
