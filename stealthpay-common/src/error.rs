//! Standardized error handling for StealthPay
//!
//! Send outcomes are reported through [`SendError`](crate::types::SendError);
//! this module covers the surrounding infrastructure (configuration files,
//! persistence, serialization) with a single error type that carries
//! human-readable context and keeps the original error as its source.
//!
//! # Usage
//!
//! ```
//! use stealthpay_common::error::{ErrorContext, StealthPayResult};
//!
//! fn read_settings(path: &str) -> StealthPayResult<String> {
//!     std::fs::read_to_string(path).context("Failed to read settings file")
//! }
//!
//! assert!(read_settings("/definitely/not/here.toml").is_err());
//! ```

use crate::types::SendError;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// The infrastructure error type for StealthPay
#[derive(Debug, Error)]
pub enum StealthPayError {
    /// Terminal send failures surfaced through infrastructure code
    #[error("Send error: {0}")]
    Send(#[from] SendError),

    /// Configuration errors
    #[error("Configuration error: {context}")]
    Config {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// I/O errors
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// Unexpected errors that don't fit other categories
    #[error("Unexpected error: {context}")]
    Unexpected {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

/// Result alias used by infrastructure code
pub type StealthPayResult<T> = Result<T, StealthPayError>;

/// Extension trait for adding context to error types
pub trait ErrorContext<T> {
    /// Replace the error's context with a human-readable description,
    /// keeping the original error as the source.
    fn context(self, context: impl Into<String>) -> StealthPayResult<T>;
}

impl<T, E: Into<StealthPayError>> ErrorContext<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> StealthPayResult<T> {
        self.map_err(|err| {
            let context = context.into();
            match err.into() {
                StealthPayError::Config { source, .. } => StealthPayError::Config { context, source },
                StealthPayError::Io { source, .. } => StealthPayError::Io { context, source },
                StealthPayError::Serialization { source, .. } => {
                    StealthPayError::Serialization { context, source }
                }
                StealthPayError::Unexpected { source, .. } => {
                    StealthPayError::Unexpected { context, source }
                }
                other => StealthPayError::Unexpected {
                    context,
                    source: Some(Box::new(other)),
                },
            }
        })
    }
}

/// Wrap an I/O result with context
pub fn with_io_context<T>(result: Result<T, io::Error>, context: impl Into<String>) -> StealthPayResult<T> {
    result.map_err(|err| StealthPayError::Io {
        context: context.into(),
        source: err,
    })
}

impl From<io::Error> for StealthPayError {
    fn from(err: io::Error) -> Self {
        StealthPayError::Io {
            context: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for StealthPayError {
    fn from(err: serde_json::Error) -> Self {
        StealthPayError::Serialization {
            context: format!("JSON serialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<toml::de::Error> for StealthPayError {
    fn from(err: toml::de::Error) -> Self {
        StealthPayError::Serialization {
            context: format!("TOML deserialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<toml::ser::Error> for StealthPayError {
    fn from(err: toml::ser::Error) -> Self {
        StealthPayError::Serialization {
            context: format!("TOML serialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

/// Create a new configuration error with context
pub fn config_error<S: Into<String>>(context: S) -> StealthPayError {
    StealthPayError::Config {
        context: context.into(),
        source: None,
    }
}
