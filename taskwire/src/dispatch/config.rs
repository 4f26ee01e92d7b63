//! Dispatcher configuration.
//!
//! This module contains the [`DispatcherConfig`] struct and the defaults it
//! starts from.

use std::time::Duration;

// =============================================================================
// Configuration Constants
// =============================================================================

/// Default pause before a worker that just failed is handed more work.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Failures are logged at WARN by default.
pub const DEFAULT_WARN: bool = true;

/// Per-call result logging is off by default.
pub const DEFAULT_SPEW: bool = false;

// =============================================================================
// Dispatcher Configuration
// =============================================================================

/// Configuration for the dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Log each contained failure at WARN instead of DEBUG.
    pub warn: bool,

    /// Log every successful call with its arguments and result.
    pub spew: bool,

    /// Queue-wide default for [`CallOptions::wants_failure_as_value`].
    ///
    /// Also decides how failed `update` broadcasts are reported.
    ///
    /// [`CallOptions::wants_failure_as_value`]: crate::task::CallOptions::wants_failure_as_value
    pub failure_as_value: bool,

    /// How long a worker rests after a failed call.
    pub recovery_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            warn: DEFAULT_WARN,
            spew: DEFAULT_SPEW,
            failure_as_value: false,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
        }
    }
}

impl From<&crate::config::DispatcherSettings> for DispatcherConfig {
    fn from(settings: &crate::config::DispatcherSettings) -> Self {
        Self {
            warn: settings.warn,
            spew: settings.spew,
            failure_as_value: settings.failure_as_value,
            recovery_delay: settings.recovery_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_default() {
        let config = DispatcherConfig::default();
        assert!(config.warn);
        assert!(!config.spew);
        assert!(!config.failure_as_value);
        assert_eq!(config.recovery_delay, DEFAULT_RECOVERY_DELAY);
    }

    #[test]
    fn test_from_settings() {
        let settings = crate::config::DispatcherSettings {
            warn: false,
            spew: true,
            failure_as_value: true,
            recovery_delay: Duration::from_millis(250),
        };
        let config = DispatcherConfig::from(&settings);
        assert!(!config.warn);
        assert!(config.spew);
        assert!(config.failure_as_value);
        assert_eq!(config.recovery_delay, Duration::from_millis(250));
    }
}
