//! Rate-limited instrument channel.
//!
//! Some instruments and bus controllers corrupt or drop commands issued faster than
//! their firmware can process them. [`RateLimitedChannel`] wraps one [`Connection`]
//! and guarantees that no operation starts less than `interval` after the previous
//! operation on the same channel *finished*.
//!
//! The wait is a coarse blocking sleep followed by short (100 µs) polling sleeps, so
//! the gap is never shorter than `interval` and overshoots by at most a scheduler
//! tick. An interval of zero disables throttling entirely.
//!
//! Every operation takes `&mut self`: a channel is confined to the thread that owns
//! it, which is what makes the interval guarantee hold.

use super::{Connection, ConnectionOptions, Connector};
use crate::error::{AppResult, ScanError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Granularity of the final polling phase of the throttle wait.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Below this remaining wait, sleep in `POLL_INTERVAL` steps instead of one block.
const SPIN_WINDOW: Duration = Duration::from_millis(2);

/// A throttled, stateful connection to one instrument.
///
/// # Example
///
/// ```no_run
/// use current_scan::instrument::mock::SimulatedBench;
/// use current_scan::instrument::{ConnectionOptions, RateLimitedChannel};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> current_scan::error::AppResult<()> {
/// let bench = Arc::new(SimulatedBench::default());
/// let mut meter = RateLimitedChannel::new(
///     bench,
///     "GPIB0::14::INSTR",
///     Duration::from_millis(50),
///     ConnectionOptions::default(),
/// );
/// meter.open()?;
/// meter.write("*RST")?;
/// let reading = meter.query("READ?")?; // starts >= 50 ms after *RST completed
/// meter.close()?;
/// # Ok(())
/// # }
/// ```
pub struct RateLimitedChannel {
    resource: String,
    interval: Duration,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    last_request: Instant,
}

impl RateLimitedChannel {
    /// Create a closed channel for `resource`.
    pub fn new(
        connector: Arc<dyn Connector>,
        resource: impl Into<String>,
        interval: Duration,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            resource: resource.into(),
            interval,
            options,
            connector,
            connection: None,
            last_request: Instant::now(),
        }
    }

    /// Resource identifier this channel talks to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Minimum gap enforced between operations.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `open()` succeeded and `close()` has not been called since.
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Establish the underlying connection and reset the throttle clock to now.
    ///
    /// Opening a channel that is already open fails with `ScanError::AlreadyOpen`
    /// and leaves the existing connection in place.
    pub fn open(&mut self) -> AppResult<()> {
        if self.connection.is_some() {
            return Err(ScanError::AlreadyOpen {
                resource: self.resource.clone(),
            });
        }
        let connection = self.connector.open(&self.resource, &self.options)?;
        self.connection = Some(connection);
        self.last_request = Instant::now();
        debug!(
            resource = %self.resource,
            connector = self.connector.name(),
            interval_us = self.interval.as_micros() as u64,
            "Channel opened"
        );
        Ok(())
    }

    /// Issue `command` with no expected reply.
    ///
    /// Transport failures are returned as-is; there is no retry.
    pub fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(resource = %self.resource, command, "write");
        self.throttled(|connection| connection.write(command))
    }

    /// Issue `command` and block for the reply.
    ///
    /// The reply is stripped of line terminators. An empty reply is a
    /// `ScanError::Communication`.
    pub fn query(&mut self, command: &str) -> AppResult<String> {
        let response = self.throttled(|connection| connection.query(command))?;
        let response = response.trim_end_matches(['\r', '\n']).to_string();
        trace!(resource = %self.resource, command, response = %response, "query");
        if response.trim().is_empty() {
            return Err(ScanError::communication(
                &self.resource,
                format!("empty response to '{}'", command),
            ));
        }
        Ok(response)
    }

    /// Read one pending response without sending a command.
    ///
    /// Rarely needed: prefer [`query`](Self::query), which pairs the request with
    /// its reply under a single throttle wait.
    pub fn read(&mut self) -> AppResult<String> {
        let response = self.throttled(|connection| connection.read())?;
        Ok(response.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Release the connection.
    ///
    /// Closing a channel that is not open fails with `ScanError::NotOpen`.
    pub fn close(&mut self) -> AppResult<()> {
        let mut connection = self.connection.take().ok_or_else(|| ScanError::NotOpen {
            resource: self.resource.clone(),
        })?;
        connection.close()?;
        debug!(resource = %self.resource, "Channel closed");
        Ok(())
    }

    fn throttled<T>(
        &mut self,
        op: impl FnOnce(&mut dyn Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        if self.connection.is_none() {
            return Err(ScanError::NotOpen {
                resource: self.resource.clone(),
            });
        }
        self.wait_time();

        let result = match self.connection.as_deref_mut() {
            Some(connection) => op(connection),
            None => Err(ScanError::NotOpen {
                resource: self.resource.clone(),
            }),
        };
        // The clock restarts when the request finishes, failed or not.
        self.last_request = Instant::now();
        result
    }

    /// Block until `interval` has elapsed since the last request finished.
    fn wait_time(&self) {
        if self.interval.is_zero() {
            return;
        }
        let deadline = self.last_request + self.interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            if remaining > SPIN_WINDOW {
                thread::sleep(remaining - SPIN_WINDOW);
            } else {
                thread::sleep(POLL_INTERVAL.min(remaining));
            }
        }
    }
}

impl Drop for RateLimitedChannel {
    fn drop(&mut self) {
        if self.connection.is_some() {
            if let Err(e) = self.close() {
                warn!(resource = %self.resource, error = %e, "Failed to close channel on drop");
            }
        }
    }
}

impl std::fmt::Debug for RateLimitedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedChannel")
            .field("resource", &self.resource)
            .field("interval", &self.interval)
            .field("connector", &self.connector.name())
            .field("open", &self.is_open())
            .finish()
    }
}
