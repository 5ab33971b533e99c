//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur between the configuration file and the instruments on
//! the bus.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: a channel could not be opened (resource missing, bus offline).
//! - **`Communication`**: a `write`/`query` failed at the transport, or the instrument
//!   answered with an empty response.
//! - **`Parse`**: a response arrived but did not have the expected shape
//!   (e.g. the meter's comma-separated `READ?` triple).
//! - **`AlreadyRunning`**: `start()` on an acquisition loop that is already running.
//! - **`NotOpen`**: an operation on a channel that was never opened or already closed.
//! - **`AlreadyOpen`**: `open()` on a channel that still holds a connection.
//! - **`Configuration`** / **`Config`**: semantic validation failures and figment
//!   extraction failures respectively.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to open '{resource}': {message}")]
    Connection { resource: String, message: String },

    #[error("Communication with '{resource}' failed: {message}")]
    Communication { resource: String, message: String },

    #[error("Unexpected response '{response}': {message}")]
    Parse { response: String, message: String },

    #[error("Acquisition loop is already running")]
    AlreadyRunning,

    #[error("Channel '{resource}' is not open")]
    NotOpen { resource: String },

    #[error("Channel '{resource}' is already open")]
    AlreadyOpen { resource: String },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Acquisition thread panicked")]
    ThreadPanicked,
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}

impl ScanError {
    pub(crate) fn connection(resource: &str, message: impl ToString) -> Self {
        ScanError::Connection {
            resource: resource.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn communication(resource: &str, message: impl ToString) -> Self {
        ScanError::Communication {
            resource: resource.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn parse(response: &str, message: impl ToString) -> Self {
        ScanError::Parse {
            response: response.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_state_errors_name_the_resource() {
        let err = ScanError::AlreadyOpen {
            resource: "GPIB0::10::INSTR".to_string(),
        };
        assert_eq!(err.to_string(), "Channel 'GPIB0::10::INSTR' is already open");
    }

    #[test]
    fn messages_name_the_resource() {
        let err = ScanError::connection("GPIB0::14::INSTR", "no listener");
        let msg = err.to_string();
        assert!(msg.contains("GPIB0::14::INSTR"));
        assert!(msg.contains("no listener"));
    }

    #[test]
    fn figment_errors_are_boxed() {
        let err: ScanError = figment::Error::from("missing field".to_string()).into();
        match err {
            ScanError::Config(inner) => assert!(inner.to_string().contains("missing field")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
