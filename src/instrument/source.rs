//! Bias voltage source driver (Agilent-style SCPI).
//!
//! Command set used by the scan:
//! - `*RST` - return to a known state (output off, 0 V)
//! - `OUTP ON` / `OUTP OFF` - output relay
//! - `VOLT <v>` - voltage setpoint
//! - `VOLT?` - setpoint as the instrument holds it (after any clamping)

use super::{parse_f64_response, RateLimitedChannel};
use crate::error::AppResult;
use tracing::{debug, info};

/// Bias voltage source on a rate-limited channel.
#[derive(Debug)]
pub struct BiasSource {
    channel: RateLimitedChannel,
}

impl BiasSource {
    /// Wrap a (not yet opened) channel.
    pub fn new(channel: RateLimitedChannel) -> Self {
        Self { channel }
    }

    /// Open the underlying channel.
    pub fn open(&mut self) -> AppResult<()> {
        self.channel.open()
    }

    /// Reset to a known state and enable the output.
    pub fn initialize(&mut self) -> AppResult<()> {
        self.channel.write("*RST")?;
        self.channel.write("OUTP ON")?;
        info!(resource = self.channel.resource(), "Bias source reset, output enabled");
        Ok(())
    }

    /// Command a new voltage setpoint.
    pub fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        debug!(voltage = volts, "Setting bias voltage");
        self.channel.write(&format!("VOLT {}", volts))
    }

    /// Setpoint as reported by the instrument.
    ///
    /// This is the device's own report, not the last commanded value, so clamped or
    /// rejected commands show up here.
    pub fn voltage(&mut self) -> AppResult<f64> {
        let response = self.channel.query("VOLT?")?;
        parse_f64_response(&response)
    }

    /// Disable the output.
    pub fn disable_output(&mut self) -> AppResult<()> {
        self.channel.write("OUTP OFF")?;
        info!(resource = self.channel.resource(), "Bias source output disabled");
        Ok(())
    }

    /// Close the underlying channel.
    pub fn close(&mut self) -> AppResult<()> {
        self.channel.close()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &RateLimitedChannel {
        &self.channel
    }
}
