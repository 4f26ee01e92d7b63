//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use ini::Ini;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::file::ConfigFileError;
use super::settings::ConfigFile;
use crate::wire::MAX_CHUNK_SIZE;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [dispatcher] section
    if let Some(section) = ini.section(Some("dispatcher")) {
        if let Some(v) = section.get("warn") {
            config.dispatcher.warn = parse_bool("dispatcher", "warn", v)?;
        }
        if let Some(v) = section.get("spew") {
            config.dispatcher.spew = parse_bool("dispatcher", "spew", v)?;
        }
        if let Some(v) = section.get("failure_as_value") {
            config.dispatcher.failure_as_value = parse_bool("dispatcher", "failure_as_value", v)?;
        }
        if let Some(v) = section.get("recovery_delay_ms") {
            config.dispatcher.recovery_delay = parse_millis("dispatcher", "recovery_delay_ms", v)?;
        }
    }

    // [wire] section
    if let Some(section) = ini.section(Some("wire")) {
        if let Some(v) = section.get("chunk_size") {
            let size: usize = parse_number("wire", "chunk_size", v)?;
            if size == 0 {
                return Err(invalid("wire", "chunk_size", v, "must be at least 1 byte"));
            }
            if size > MAX_CHUNK_SIZE {
                return Err(invalid(
                    "wire",
                    "chunk_size",
                    v,
                    &format!("must not exceed {MAX_CHUNK_SIZE} bytes"),
                ));
            }
            config.wire.chunk_size = size;
        }
        if let Some(v) = section.get("reconnect_interval_ms") {
            config.wire.reconnect_interval = parse_millis("wire", "reconnect_interval_ms", v)?;
        }
        if let Some(v) = section.get("reconnect_attempts") {
            let attempts: u32 = parse_number("wire", "reconnect_attempts", v)?;
            if attempts == 0 {
                return Err(invalid("wire", "reconnect_attempts", v, "must be at least 1"));
            }
            config.wire.reconnect_attempts = attempts;
        }
        if let Some(v) = section.get("resend_attempts") {
            config.wire.resend_attempts = parse_number("wire", "resend_attempts", v)?;
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = section.get("level") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.level = v.to_string();
            }
        }
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.directory = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if v.is_empty() || v.contains('/') {
                return Err(invalid("logging", "file", v, "must be a plain file name"));
            }
            config.logging.file = v.to_string();
        }
    }

    Ok(config)
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigFileError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(section, key, value, "must be true or false")),
    }
}

fn parse_number<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a non-negative integer"))
}

fn parse_millis(section: &str, key: &str, value: &str) -> Result<Duration, ConfigFileError> {
    parse_number(section, key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_LOG_FILE, DEFAULT_LOG_LEVEL};
    use crate::dispatch::DEFAULT_RECOVERY_DELAY;
    use crate::wire::DEFAULT_CHUNK_SIZE;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp_dir.path().join("absent.ini")).unwrap();

        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.dispatcher.recovery_delay, DEFAULT_RECOVERY_DELAY);
        assert_eq!(config.wire.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.logging.level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.logging.file, DEFAULT_LOG_FILE);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_full_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("taskwire.ini");

        std::fs::write(
            &config_path,
            r#"
[dispatcher]
warn = no
spew = yes
failure_as_value = true
recovery_delay_ms = 250

[wire]
chunk_size = 4096
reconnect_interval_ms = 20
reconnect_attempts = 5
resend_attempts = 0

[logging]
level = taskwire=debug
directory = /tmp/taskwire-logs
file = worker.log
"#,
        )
        .unwrap();

        let config = ConfigFile::load_from(&config_path).unwrap();
        assert!(!config.dispatcher.warn);
        assert!(config.dispatcher.spew);
        assert!(config.dispatcher.failure_as_value);
        assert_eq!(config.dispatcher.recovery_delay, Duration::from_millis(250));
        assert_eq!(config.wire.chunk_size, 4096);
        assert_eq!(config.wire.reconnect_interval, Duration::from_millis(20));
        assert_eq!(config.wire.reconnect_attempts, 5);
        assert_eq!(config.wire.resend_attempts, 0);
        assert_eq!(config.logging.level, "taskwire=debug");
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/tmp/taskwire-logs"))
        );
        assert_eq!(config.logging.file, "worker.log");
    }

    #[test]
    fn test_invalid_bool() {
        let err = ConfigFile::parse("[dispatcher]\nwarn = maybe\n").unwrap_err();
        assert!(err.to_string().contains("dispatcher.warn"));
        assert!(err.to_string().contains("maybe"));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = ConfigFile::parse("[wire]\nchunk_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_chunk_size_larger_than_a_frame_rejected() {
        let ini = format!("[wire]\nchunk_size = {}\n", MAX_CHUNK_SIZE + 1);
        let err = ConfigFile::parse(&ini).unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref key, .. } if key == "chunk_size"
        ));

        let ini = format!("[wire]\nchunk_size = {MAX_CHUNK_SIZE}\n");
        assert_eq!(ConfigFile::parse(&ini).unwrap().wire.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let err = ConfigFile::parse("[dispatcher]\nrecovery_delay_ms = -5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref key, .. } if key == "recovery_delay_ms"
        ));
    }

    #[test]
    fn test_log_file_must_be_plain_name() {
        assert!(ConfigFile::parse("[logging]\nfile = ../escape.log\n").is_err());
    }

    #[test]
    fn test_settings_convert_to_runtime_config() {
        let config = ConfigFile::parse(
            "[dispatcher]\nrecovery_delay_ms = 10\n[wire]\nreconnect_attempts = 7\n",
        )
        .unwrap();

        let dispatcher = crate::dispatch::DispatcherConfig::from(&config.dispatcher);
        assert_eq!(dispatcher.recovery_delay, Duration::from_millis(10));

        let policy = crate::wire::ReconnectPolicy::from(&config.wire);
        assert_eq!(policy.max_attempts, 7);
    }
}
