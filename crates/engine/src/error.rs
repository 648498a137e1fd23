use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to start execution unit: {0}")]
    Spawn(#[source] io::Error),

    /// The unit refused to run the submission, e.g. because it does not compile.
    #[error("{0}")]
    Rejected(String),

    #[error("execution unit i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("execution backend error: {0}")]
    Backend(String),

    #[error("failed to terminate execution unit: {0}")]
    Terminate(String),

    #[error("execution unit unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, UnitError>;
