use thiserror::Error;

use crate::types::ErrorKind;

#[derive(Error, Debug)]
pub enum Error {
    // Daemon reachability and host identification
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration for device: {0}")]
    MissingConfig(String),

    // Device operation errors
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Device not running: {0}")]
    NotRunning(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Conversion not ready after {0} polls")]
    ConversionTimeout(usize),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Pick the error kind to report for this error at an operation boundary.
    ///
    /// Connection-class errors keep their own tag regardless of where they
    /// surface; everything else takes the kind of the failing operation.
    #[must_use]
    pub fn suggested_kind(&self, boundary: ErrorKind) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            _ => boundary,
        }
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
