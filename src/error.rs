//! Custom error types for the archive engine.
//!
//! This module defines the primary error type, `ArchiveError`, for the entire engine.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur, from configuration issues to data
//! source and storage problems.
//!
//! ## Error Hierarchy
//!
//! `ArchiveError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration file.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine, such as a
//!   negative scan period or a duplicate group name.
//! - **`Io`** / **`Csv`**: File system and CSV writer failures in the storage layer.
//! - **`Source`**: A data source could not connect, subscribe or poll. Caught at the
//!   channel boundary and logged; never stops other channels.
//! - **`Storage`**: The storage writer rejected an operation.
//! - **`Invariant`**: A bookkeeping rule was violated (for example a group's connected
//!   count going negative). These are logged as errors and the offending call becomes
//!   a no-op; they never abort the process.
//! - **`ShutdownFailed`**: Collects every failure seen while stopping the engine.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, ArchiveError>;

/// Primary error type for the archive engine.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but contains invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system or other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV storage writer failure.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serializing a status snapshot or configuration dump failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A data source operation failed.
    #[error("Data source '{channel}': {message}")]
    Source {
        /// Channel name of the failing source.
        channel: String,
        /// Description of the failure.
        message: String,
    },

    /// The storage layer rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation requires a running engine.
    #[error("Engine is not running")]
    NotRunning,

    /// Operation requires a stopped engine or channel.
    #[error("'{0}' is running, stop it first")]
    Running(String),

    /// A bookkeeping invariant was violated.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Shutdown finished, but some steps failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<ArchiveError>),
}

impl From<figment::Error> for ArchiveError {
    fn from(value: figment::Error) -> Self {
        ArchiveError::Config(Box::new(value))
    }
}

impl From<toml::ser::Error> for ArchiveError {
    fn from(value: toml::ser::Error) -> Self {
        ArchiveError::Serialization(value.to_string())
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(value: serde_json::Error) -> Self {
        ArchiveError::Serialization(value.to_string())
    }
}

impl ArchiveError {
    /// Build a data source error for `channel`.
    pub fn source(channel: impl Into<String>, message: impl Into<String>) -> Self {
        ArchiveError::Source {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Whether the surrounding loop may simply continue with the next item.
    ///
    /// Configuration errors are permanent; everything that happens while the
    /// engine runs is recoverable from the engine's point of view.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ArchiveError::Config(_) | ArchiveError::Configuration(_) | ArchiveError::ShutdownFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_names_channel() {
        let err = ArchiveError::source("BL:current", "poll failed");
        assert_eq!(err.to_string(), "Data source 'BL:current': poll failed");
        assert!(err.is_recoverable());
    }

    #[test]
    fn configuration_errors_are_permanent() {
        let err = ArchiveError::Configuration("negative period".into());
        assert!(!err.is_recoverable());
        let err = ArchiveError::ShutdownFailed(vec![ArchiveError::Storage("disk full".into())]);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn invariant_is_recoverable() {
        let err = ArchiveError::Invariant("connect count below 0".into());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("below 0"));
    }
}
