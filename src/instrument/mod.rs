//! Instrument communication.
//!
//! The transport layer is an opaque, blocking request/response channel identified by
//! a resource name. This module defines that seam and builds the rest on top of it:
//!
//! - [`Connector`] / [`Connection`]: the transport seam (VISA, simulated bench, ...)
//! - [`RateLimitedChannel`]: enforces a minimum gap between consecutive operations
//! - [`BiasSource`] / [`Picoammeter`]: the two instruments of the bias scan
//!
//! All calls block. Nothing here is async: the acquisition loop owns its channels on
//! a dedicated thread.

use crate::error::{AppResult, ScanError};
use std::time::Duration;

pub mod channel;
pub mod meter;
pub mod mock;
pub mod source;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use channel::RateLimitedChannel;
pub use meter::{parse_read_response, MeterSample, Picoammeter};
pub use source::BiasSource;

/// Transport options applied when a resource is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Read/write timeout enforced by the transport
    pub timeout: Duration,
    /// Appended to every outgoing command
    pub write_termination: String,
    /// Marks the end of an incoming response
    pub read_termination: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            write_termination: "\n".to_string(),
            read_termination: "\n".to_string(),
        }
    }
}

impl ConnectionOptions {
    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the terminator appended to commands
    pub fn with_write_termination(mut self, terminator: impl Into<String>) -> Self {
        self.write_termination = terminator.into();
        self
    }

    /// Set the terminator that ends responses
    pub fn with_read_termination(mut self, terminator: impl Into<String>) -> Self {
        self.read_termination = terminator.into();
        self
    }
}

/// An open, blocking connection to one instrument.
///
/// Implementations report transport failures as `ScanError::Communication`.
pub trait Connection: Send {
    /// Send a command with no expected reply.
    fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and block for its reply.
    fn query(&mut self, command: &str) -> AppResult<String>;

    /// Read one response without sending anything first.
    fn read(&mut self) -> AppResult<String>;

    /// Release the connection.
    fn close(&mut self) -> AppResult<()>;
}

/// Opens connections by resource name (e.g. `GPIB0::14::INSTR`).
pub trait Connector: Send + Sync {
    /// Open `resource`, failing with `ScanError::Connection` if it cannot be reached.
    fn open(&self, resource: &str, options: &ConnectionOptions)
        -> AppResult<Box<dyn Connection>>;

    /// Short name for logs ("visa", "simulated").
    fn name(&self) -> &str;
}

/// Parse a floating-point response.
///
/// Handles the SCPI number formats instruments answer with (`+1.000000E+00`).
pub fn parse_f64_response(response: &str) -> AppResult<f64> {
    let trimmed = response.trim();
    let value = trimmed.parse::<f64>().map_err(|e| {
        ScanError::parse(response, format!("not a number ({})", e))
    })?;
    if !value.is_finite() {
        return Err(ScanError::parse(response, "not a finite number"));
    }
    Ok(value)
}
