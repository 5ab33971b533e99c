//! Picoammeter driver (Keithley 6485-style SCPI).
//!
//! Low-current DC measurement at a fixed range and integration time. The meter's
//! absolute accuracy at these ranges depends on a fresh zero reference, so
//! [`Picoammeter::initialize`] always runs the zero-correction sequence:
//!
//! ```text
//! SYST:ZCH ON      zero check on (input shorted)
//! SYST:ZCOR:ACQ    acquire zero reference
//! SYST:ZCOR ON     apply it to subsequent readings
//! SYST:ZCH OFF     reconnect the input
//! ```
//!
//! `READ?` answers with `<current><unit>,<timestamp>,<status>`, e.g.
//! `-1.234E-9A,12.50,+0`.

use super::RateLimitedChannel;
use crate::error::{AppResult, ScanError};
use tracing::info;

/// Measurement setup applied on initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSetup {
    /// Integration time in power-line cycles
    pub nplc: f64,
    /// Measurement range in amps
    pub range: f64,
}

impl Default for MeterSetup {
    fn default() -> Self {
        Self {
            nplc: 6.0,
            range: 2e-8,
        }
    }
}

/// One parsed `READ?` answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    /// Measured current (A)
    pub current: f64,
    /// Meter timestamp (s since the meter's last reset)
    pub timestamp: f64,
}

/// Picoammeter on a rate-limited channel.
#[derive(Debug)]
pub struct Picoammeter {
    channel: RateLimitedChannel,
}

impl Picoammeter {
    /// Wrap a (not yet opened) channel.
    pub fn new(channel: RateLimitedChannel) -> Self {
        Self { channel }
    }

    /// Open the underlying channel.
    pub fn open(&mut self) -> AppResult<()> {
        self.channel.open()
    }

    /// Reset, configure for DC current and zero-correct.
    pub fn initialize(&mut self, setup: &MeterSetup) -> AppResult<()> {
        self.channel.write("*RST")?;
        self.channel.write(&format!("CURR:NPLC {}", setup.nplc))?;
        self.channel.write(&format!("CURR:RANG {:e}", setup.range))?;
        self.channel.write("CONF:CURR")?;
        self.zero_correct()?;
        info!(
            resource = self.channel.resource(),
            nplc = setup.nplc,
            range = setup.range,
            "Picoammeter configured and zero-corrected"
        );
        Ok(())
    }

    /// Acquire and enable a zero correction.
    pub fn zero_correct(&mut self) -> AppResult<()> {
        self.channel.write("SYST:ZCH ON")?;
        self.channel.write("SYST:ZCOR:ACQ")?;
        self.channel.write("SYST:ZCOR ON")?;
        self.channel.write("SYST:ZCH OFF")
    }

    /// Trigger and fetch one reading.
    pub fn read(&mut self) -> AppResult<MeterSample> {
        let response = self.channel.query("READ?")?;
        parse_read_response(&response)
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

/// Parse a `READ?` answer: `<current><unit>,<timestamp>,<status>`.
///
/// Exactly three fields are required. A trailing alphabetic unit suffix on the
/// current is stripped; both numbers must be finite.
pub fn parse_read_response(response: &str) -> AppResult<MeterSample> {
    let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(ScanError::parse(
            response,
            format!("expected 3 comma-separated fields, got {}", fields.len()),
        ));
    }

    let current_field = fields[0]
        .strip_suffix(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(fields[0]);
    let current = parse_finite(response, current_field, "current")?;
    let timestamp = parse_finite(response, fields[1], "timestamp")?;

    Ok(MeterSample { current, timestamp })
}

fn parse_finite(response: &str, field: &str, name: &str) -> AppResult<f64> {
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ScanError::parse(
            response,
            format!("{} field '{}' is not a finite number", name, field),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{SimulatedBench, METER_RESOURCE};
    use crate::instrument::ConnectionOptions;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn parses_reference_response() {
        let sample = parse_read_response("-1.234E-9A,12.50,+0").unwrap();
        assert_eq!(sample.current, -1.234e-9);
        assert_eq!(sample.timestamp, 12.50);
    }

    #[test]
    fn parses_with_terminator_and_exponent_timestamp() {
        let sample = parse_read_response("+2.000000E-09A,+3.250000E+00,+0.000000E+00\n").unwrap();
        assert_eq!(sample.current, 2e-9);
        assert_eq!(sample.timestamp, 3.25);
    }

    #[test]
    fn rejects_response_without_commas() {
        assert!(matches!(
            parse_read_response("-1.234E-9A"),
            Err(ScanError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_read_response("-1.234E-9A,12.50").is_err());
        assert!(parse_read_response("-1.234E-9A,12.50,+0,extra").is_err());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(parse_read_response("overflowA,12.50,+0").is_err());
        assert!(parse_read_response("-1.234E-9A,soon,+0").is_err());
        assert!(parse_read_response("A,12.50,+0").is_err());
    }

    #[test]
    fn initialize_runs_zero_correction_in_order() {
        let bench = Arc::new(SimulatedBench::default());
        let mut meter = Picoammeter::new(RateLimitedChannel::new(
            bench.clone(),
            METER_RESOURCE,
            Duration::ZERO,
            ConnectionOptions::default(),
        ));
        meter.open().unwrap();
        meter.initialize(&MeterSetup::default()).unwrap();

        assert_eq!(
            bench.commands_for(METER_RESOURCE),
            vec![
                "*RST",
                "CURR:NPLC 6",
                "CURR:RANG 2e-8",
                "CONF:CURR",
                "SYST:ZCH ON",
                "SYST:ZCOR:ACQ",
                "SYST:ZCOR ON",
                "SYST:ZCH OFF",
            ]
        );
        assert!(bench.meter_ready());
        assert_eq!(meter.read().unwrap().current, 0.0);
    }
}
