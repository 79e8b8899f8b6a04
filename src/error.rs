use std::io;

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, FilterError>;

/// Errors surfaced by the filter pipeline.
///
/// Most failure modes are recovered close to where they occur (a missing
/// fact degrades to `Undefined`, a failing checker counts as a non-match);
/// the variants here are the ones that either cross the public boundary or
/// feed the recovery paths.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A lazy descriptor carried a method tag outside the supported
    /// vocabulary. Fatal: the descriptor was constructed incorrectly.
    #[error("unknown compute method: {0}")]
    UnknownComputeMethod(String),

    /// A lazy descriptor named a known method but its parameters do not
    /// fit that method's shape.
    #[error("bad descriptor for method {method}: {message}")]
    BadDescriptor { method: String, message: String },

    /// A required fact was never seeded or declared. Recovered at the
    /// store boundary by substituting `Undefined`.
    #[error("fact is not set: {0}")]
    UnsetVariable(String),

    /// The shared condition budget was exhausted. Informational: runs are
    /// never aborted for this, the flag is carried on the run result.
    #[error("condition limit of {limit} exceeded ({used} used)")]
    ConditionLimitExceeded { used: u32, limit: u32 },

    #[error("filter file path does not exist: {0}")]
    MissingPath(String),

    #[error("failed to read filters from {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse filters from {path}: {message}")]
    Parse { path: String, message: String },

    #[error("duplicate filter identifier detected: {0}")]
    DuplicateFilter(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("consequence error: {0}")]
    Consequence(#[from] ConsequenceError),

    #[error("failed to initialise tracing: {0}")]
    Tracing(String),
}

impl FilterError {
    pub fn from_io(path: impl Into<std::path::PathBuf>, source: io::Error) -> Self {
        FilterError::Io {
            path: path.into().display().to_string(),
            source,
        }
    }

    pub fn parse_error(path: impl Into<std::path::PathBuf>, message: impl Into<String>) -> Self {
        FilterError::Parse {
            path: path.into().display().to_string(),
            message: message.into(),
        }
    }
}

/// Error raised by a [`RuleChecker`](crate::checker::RuleChecker)
/// implementation. Always recovered by the run loop: the filter is treated
/// as a non-match, never as a match.
#[derive(Debug, Error)]
#[error("rule checker failed: {0}")]
pub struct CheckError(pub String);

/// Errors produced while parsing or executing consequences.
#[derive(Debug, Error)]
pub enum ConsequenceError {
    /// The raw parameter list attached to a filter does not fit the
    /// consequence kind. The declaration is skipped with a warning.
    #[error("bad parameters for consequence '{kind}': {message}")]
    BadParams { kind: String, message: String },

    #[error("execution of consequence '{kind}' failed: {message}")]
    ExecutionFailed { kind: String, message: String },
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for environment variable {key}: {message}")]
    InvalidEnvVar { key: String, message: String },
}
