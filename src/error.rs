//! Error types and handling for pvcontrol
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for pvcontrol operations
pub type Result<T> = std::result::Result<T, PvControlError>;

/// Main error type for pvcontrol
#[derive(Debug, Error)]
pub enum PvControlError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// HTTP communication errors with a peripheral
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// Peripheral API errors (unexpected payloads, vendor error responses)
    #[error("API error: {message}")]
    Api { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl PvControlError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PvControlError::Config {
            message: message.into(),
        }
    }

    /// Create a new HTTP error
    pub fn http<S: Into<String>>(message: S) -> Self {
        PvControlError::Http {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        PvControlError::Api {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        PvControlError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PvControlError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        PvControlError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        PvControlError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PvControlError {
    fn from(err: std::io::Error) -> Self {
        PvControlError::io(err.to_string())
    }
}

impl From<serde_json::Error> for PvControlError {
    fn from(err: serde_json::Error) -> Self {
        PvControlError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PvControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PvControlError::timeout(err.to_string())
        } else {
            PvControlError::http(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for PvControlError {
    fn from(err: chrono::ParseError) -> Self {
        PvControlError::validation("datetime", &err.to_string())
    }
}
