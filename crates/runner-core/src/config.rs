//! Configuration for a runner invocation.
//!
//! Uses the same key=value format as the `.xctool-runner/config` file.
//! Precedence: CLI flags > `--config` file > `.xctool-runner/config` > defaults.

use crate::types::{parse_sessions, CaptureMode, Session, SessionSpecError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file looked up relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".xctool-runner/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid devices: {0}")]
    InvalidDevices(#[from] SessionSpecError),
    #[error("partition count must be at least 1")]
    ZeroPartitionCount,
    #[error("partition {partition} out of range for {partition_count} partition(s)")]
    PartitionOutOfRange {
        partition: usize,
        partition_count: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    // Tooling
    pub xctool_path: PathBuf,
    pub sdk: String,
    pub build_dir: PathBuf,

    // Supervision
    /// Seconds without output before a run counts as hung.
    pub timeout_sec: u32,
    pub capture: CaptureMode,

    // Retries
    /// Attempts allowed without progress beyond the first.
    pub retries: u32,

    // Partitioning
    pub partition: usize,
    pub partition_count: usize,

    // Sessions
    /// Device list, `<name>,<os version>` pairs separated by `;`.
    pub devices: String,
    pub fresh_simulator: bool,
    pub reset_simulator: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xctool_path: PathBuf::from("/usr/local/bin/xctool"),
            sdk: "iphonesimulator".to_string(),
            build_dir: PathBuf::from("build"),
            timeout_sec: 120,
            capture: CaptureMode::Pty,
            retries: 4,
            partition: 0,
            partition_count: 1,
            devices: "iPhone 5,9.0;iPad 2,9.0".to_string(),
            fresh_simulator: true,
            reset_simulator: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "xctool_path" => self.xctool_path = PathBuf::from(value),
            "sdk" => self.sdk = value.to_string(),
            "build_dir" => self.build_dir = PathBuf::from(value),
            "timeout_sec" | "timeout" => self.timeout_sec = Self::parse_int(key, value)?,
            "capture" => {
                self.capture = value.parse().map_err(ConfigError::InvalidLine)?;
            }
            "retries" => self.retries = Self::parse_int(key, value)?,
            "partition" => self.partition = Self::parse_int(key, value)?,
            "partition_count" => self.partition_count = Self::parse_int(key, value)?,
            "devices" => self.devices = value.to_string(),
            "fresh_simulator" => self.fresh_simulator = Self::parse_bool(key, value)?,
            "reset_simulator" => self.reset_simulator = Self::parse_bool(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve a relative build directory against the working directory.
    pub fn resolve_paths(&mut self, working_dir: &Path) {
        if self.build_dir.is_relative() {
            self.build_dir = working_dir.join(&self.build_dir);
        }
    }

    /// Parse the configured device list into sessions.
    pub fn sessions(&self) -> Result<Vec<Session>, ConfigError> {
        Ok(parse_sessions(&self.devices)?)
    }

    /// Check settings that cannot be expressed by the field types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_count == 0 {
            return Err(ConfigError::ZeroPartitionCount);
        }
        if self.partition >= self.partition_count {
            return Err(ConfigError::PartitionOutOfRange {
                partition: self.partition,
                partition_count: self.partition_count,
            });
        }
        self.sessions()?;
        Ok(())
    }

    /// Path of the json-stream reporter output inside the build directory.
    pub fn stream_path(&self) -> PathBuf {
        self.build_dir.join("stream.json")
    }

    /// Path of the per-round TSV report inside the build directory.
    pub fn report_path(&self) -> PathBuf {
        self.build_dir.join("report.tsv")
    }
}
