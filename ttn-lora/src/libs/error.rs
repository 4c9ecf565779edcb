//! Driver error types.

use std::{io::Error as IoError, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed EUI, key, data rate, TX power, port or payload. Raised before any serial I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// No terminal response within the command deadline.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The module answered with an explicit error token.
    #[error("command `{command}` failed with device error {code}")]
    Device { command: String, code: String },

    /// No join accept within the join timeout.
    #[error("join timeout after {0:?}")]
    JoinTimeout(Duration),

    /// The module reported that the join request was rejected.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// A sensor value does not fit its payload slot.
    #[error("cannot encode {field}={value}")]
    Encoding { field: &'static str, value: f64 },

    /// Link-level failure such as an unopenable port or a closed stream.
    #[error("serial error: {0}")]
    Serial(String),
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Serial(e.to_string())
    }
}

impl From<tokio_serial::Error> for Error {
    fn from(e: tokio_serial::Error) -> Self {
        Error::Serial(e.to_string())
    }
}
