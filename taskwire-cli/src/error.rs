//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;
use taskwire::config::ConfigFileError;
use taskwire::dispatch::DispatchError;
use taskwire::process::ProcessError;
use taskwire::wire::DescriptorError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(ConfigFileError),
    /// Invalid command-line argument
    Usage(String),
    /// Failed to start the async runtime
    Runtime(std::io::Error),
    /// Malformed socket descriptor
    Descriptor(DescriptorError),
    /// Failed to bind the wire server socket
    Bind {
        descriptor: String,
        error: std::io::Error,
    },
    /// Failed to start or stop a server process
    Process(ProcessError),
    /// The dispatcher refused a request
    Dispatch(DispatchError),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Bind { .. } => {
                eprintln!();
                eprintln!("Common issues:");
                eprintln!("  1. The socket directory does not exist or is not writable");
                eprintln!("  2. The socket path is longer than the platform limit (~100 bytes)");
            }
            CliError::Usage(_) => process::exit(2),
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::Usage(msg) => write!(f, "{}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
            CliError::Descriptor(e) => write!(f, "{}", e),
            CliError::Bind { descriptor, error } => {
                write!(f, "Failed to listen on '{}': {}", descriptor, error)
            }
            CliError::Process(e) => write!(f, "Server process error: {}", e),
            CliError::Dispatch(e) => write!(f, "Dispatch failed: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Descriptor(e) => Some(e),
            CliError::Bind { error, .. } => Some(error),
            CliError::Process(e) => Some(e),
            CliError::Dispatch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e)
    }
}

impl From<DescriptorError> for CliError {
    fn from(e: DescriptorError) -> Self {
        CliError::Descriptor(e)
    }
}

impl From<ProcessError> for CliError {
    fn from(e: ProcessError) -> Self {
        CliError::Process(e)
    }
}

impl From<DispatchError> for CliError {
    fn from(e: DispatchError) -> Self {
        CliError::Dispatch(e)
    }
}
