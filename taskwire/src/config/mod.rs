//! INI configuration file.
//!
//! ```ini
//! [dispatcher]
//! warn = true
//! spew = false
//! failure_as_value = false
//! recovery_delay_ms = 2000
//!
//! [wire]
//! chunk_size = 32768
//! reconnect_interval_ms = 100
//! reconnect_attempts = 100
//! resend_attempts = 3
//!
//! [logging]
//! level = info
//! directory = /var/log/taskwire
//! file = taskwire.log
//! ```
//!
//! Every key is optional; a missing file yields the defaults.

mod defaults;
mod file;
mod parser;
mod settings;

pub use defaults::{DEFAULT_LOG_FILE, DEFAULT_LOG_LEVEL};
pub use file::ConfigFileError;
pub use settings::{ConfigFile, DispatcherSettings, LoggingSettings, WireSettings};
