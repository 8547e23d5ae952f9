//! Error taxonomy shared across the daemon. Only `Fatal` variants abort
//! the process; everything else is logged and the caller continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentrydError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("subprocess {command} exited with status {status}: {stderr}")]
    Subprocess {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("sync transport error: {0}")]
    Sync(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl SentrydError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SentrydError::Io {
            path: path.into(),
            source,
        }
    }

    /// True only for the one class of error that should abort the
    /// daemon outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SentrydError::Fatal(_))
    }
}
