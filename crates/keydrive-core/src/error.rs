//! Error type shared by every keydrive crate.

use std::path::PathBuf;
use thiserror::Error;

pub type KeydriveResult<T> = Result<T, KeydriveError>;

#[derive(Debug, Error)]
pub enum KeydriveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to run `{program}`: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` failed ({status})")]
    CommandFailed { command: String, status: String },

    #[error("{0}")]
    Toolchain(String),

    #[error("unable to write key file {path}: {reason}")]
    KeyFile { path: PathBuf, reason: String },

    #[error("insufficient privileges: {0}")]
    Privilege(String),

    #[error("interrupted by operator")]
    Cancelled,
}

impl KeydriveError {
    /// True when the run was stopped by the operator rather than by a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KeydriveError::Cancelled)
    }
}
