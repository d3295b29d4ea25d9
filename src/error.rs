//! Error types for stagehand.
//!
//! Each subsystem defines its own error enum; this module provides the
//! top-level [`Error`] the binary reports from, plus the mapping from error
//! kind to process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stagehand operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a run in which one or more hosts failed.
pub const EXIT_HOST_FAILED: i32 = 2;
/// Exit code for inventory or playbook parse errors.
pub const EXIT_PARSE_ERROR: i32 = 3;
/// Exit code for playbooks using constructs outside the supported subset.
pub const EXIT_UNSUPPORTED: i32 = 4;

/// The main error type for stagehand.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed inventory source.
    #[error(transparent)]
    Inventory(#[from] crate::inventory::InventoryError),

    /// Malformed playbook, task file, or role.
    #[error(transparent)]
    Parse(#[from] crate::playbook::ParseError),

    /// Template rendering or expression evaluation failed.
    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),

    /// Transport-level failure.
    #[error(transparent)]
    Connection(#[from] crate::connection::ConnectionError),

    /// Module-level failure.
    #[error(transparent)]
    Module(#[from] crate::modules::ModuleError),

    /// Runner-level failure.
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),

    /// Vault value could not be decrypted.
    #[error(transparent)]
    Vault(#[from] crate::vault::VaultError),

    /// Variables file could not be loaded.
    #[error("failed to load variables file '{path}': {message}")]
    VarsFile {
        /// Path to the vars file
        path: PathBuf,
        /// Underlying message
        message: String,
    },

    /// One or more hosts failed or were unreachable during the run.
    #[error("{failed} host(s) failed, {unreachable} unreachable")]
    HostsFailed {
        /// Hosts that ended the run in a failed state
        failed: usize,
        /// Hosts that became unreachable
        unreachable: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps this error to the process exit code the CLI reports.
    ///
    /// `0` is success, `2` normal task failure, `3` parse/syntax error,
    /// `4` unsupported construct; everything else is `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::HostsFailed { .. } => EXIT_HOST_FAILED,
            Error::Parse(e) if e.is_unsupported() => EXIT_UNSUPPORTED,
            Error::Parse(_) | Error::Inventory(_) => EXIT_PARSE_ERROR,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::ParseError;

    #[test]
    fn test_exit_code_hosts_failed() {
        let err = Error::HostsFailed {
            failed: 1,
            unreachable: 0,
        };
        assert_eq!(err.exit_code(), EXIT_HOST_FAILED);
    }

    #[test]
    fn test_exit_code_unsupported() {
        let err = Error::Parse(ParseError::UnsupportedFeature {
            feature: "serial".to_string(),
            location: "play 'test'".to_string(),
        });
        assert_eq!(err.exit_code(), EXIT_UNSUPPORTED);
    }

    #[test]
    fn test_exit_code_parse() {
        let err = Error::Parse(ParseError::InvalidStructure("not a list".to_string()));
        assert_eq!(err.exit_code(), EXIT_PARSE_ERROR);
    }
}
