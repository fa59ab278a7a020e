//! Configuration management for pvcontrol
//!
//! The process takes one JSON configuration object with a sub-object per
//! component (`wallbox`, `meter`, `car`, `controller`, `relay`). Each
//! component factory deserializes its own typed config record from the
//! matching sub-object; missing sections and missing fields fall back to
//! defaults. Unknown adapter tags and malformed JSON are startup failures.

use crate::error::{PvControlError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration: one raw sub-object per component.
///
/// The sections stay untyped here on purpose. The concrete record type
/// depends on the adapter tag selected on the command line, so each factory
/// parses its own section via [`parse_section`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wallbox: serde_json::Value,
    pub meter: serde_json::Value,
    pub car: serde_json::Value,
    pub controller: serde_json::Value,
    pub relay: serde_json::Value,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Directory for rotated log files; empty = console only
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: String::new(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON string (the `--config` argument).
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PvControlError::config(format!("Invalid --config JSON: {}", e)))
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)?;
        Self::from_json_str(&contents)
    }
}

/// Deserialize a component config record from its raw config section.
///
/// `null` (absent section) yields the record's defaults; any other non-object
/// value or a type mismatch inside the object is a configuration error.
pub fn parse_section<T: DeserializeOwned + Default>(
    section: &serde_json::Value,
    name: &str,
) -> Result<T> {
    match section {
        serde_json::Value::Null => Ok(T::default()),
        v => serde_json::from_value(v.clone())
            .map_err(|e| PvControlError::config(format!("Invalid config section '{}': {}", name, e))),
    }
}
