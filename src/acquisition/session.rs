//! One acquisition session: both instruments open and initialized.
//!
//! The session owns the bias source and the picoammeter and knows the per-cycle
//! protocol. It has no notion of threads or run flags; [`super::Acquisition`]
//! drives it from the acquisition thread, and tests drive it cycle by cycle.

use super::{AcquisitionSettings, PendingVoltages, Reading};
use crate::error::AppResult;
use crate::instrument::{BiasSource, Connector, Picoammeter, RateLimitedChannel};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Open, initialized pair of instruments.
#[derive(Debug)]
pub struct AcquisitionSession {
    source: BiasSource,
    meter: Picoammeter,
}

impl AcquisitionSession {
    /// Open both channels, then bring both instruments to a known state.
    ///
    /// The source is reset and its output enabled; the meter is reset, configured
    /// for low-current DC measurement and zero-corrected. If anything fails, channels
    /// already opened are closed when the partially built session is dropped.
    pub fn open(connector: Arc<dyn Connector>, settings: &AcquisitionSettings) -> AppResult<Self> {
        let mut source = BiasSource::new(RateLimitedChannel::new(
            Arc::clone(&connector),
            settings.source.resource.clone(),
            settings.source.interval,
            settings.source.options.clone(),
        ));
        let mut meter = Picoammeter::new(RateLimitedChannel::new(
            connector,
            settings.meter.resource.clone(),
            settings.meter.interval,
            settings.meter.options.clone(),
        ));

        source.open()?;
        meter.open()?;
        source.initialize()?;
        meter.initialize(&settings.meter_setup)?;

        info!(
            source = source.channel().resource(),
            meter = meter.channel().resource(),
            "Acquisition session ready"
        );
        Ok(Self { source, meter })
    }

    /// Run one cycle.
    ///
    /// 1. If a setpoint is pending, pop exactly one and write it to the source.
    /// 2. Read back the source's own setpoint.
    /// 3. Trigger and parse one meter reading.
    ///
    /// Any failure aborts the cycle before a [`Reading`] exists.
    pub fn cycle(&mut self, pending: &PendingVoltages) -> AppResult<Reading> {
        let mut voltage_changed = false;
        if let Some(target) = pending.pop() {
            self.source.set_voltage(target)?;
            voltage_changed = true;
        }

        let voltage = self.source.voltage()?;
        let sample = self.meter.read()?;

        Ok(Reading {
            voltage,
            current: sample.current,
            timestamp: sample.timestamp,
            voltage_changed,
        })
    }

    /// Disable the source output and close both channels.
    ///
    /// Failures are logged and do not stop the remaining steps.
    pub fn shutdown(mut self) {
        if let Err(e) = self.source.disable_output() {
            warn!(error = %e, "Failed to disable bias output");
        }
        if let Err(e) = self.source.close() {
            warn!(error = %e, "Failed to close bias source channel");
        }
        if let Err(e) = self.meter.close() {
            warn!(error = %e, "Failed to close meter channel");
        }
        debug!("Acquisition session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{Fault, SimulatedBench, METER_RESOURCE, SOURCE_RESOURCE};
    use tracing_test::traced_test;

    fn settings() -> AcquisitionSettings {
        AcquisitionSettings::for_resources(SOURCE_RESOURCE, METER_RESOURCE)
    }

    #[test]
    fn open_initializes_both_instruments() {
        let bench = Arc::new(SimulatedBench::default());
        let session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();
        assert!(bench.source_output());
        assert!(bench.meter_ready());
        assert_eq!(bench.open_connections(), 2);

        session.shutdown();
        assert!(!bench.source_output());
        assert_eq!(bench.open_connections(), 0);
    }

    #[test]
    fn queued_voltages_consumed_one_per_cycle() {
        let bench = Arc::new(SimulatedBench::default());
        let pending = PendingVoltages::new();
        for v in [1.0, 2.0, 3.0] {
            pending.push(v);
        }
        let mut session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();

        let readings: Vec<Reading> = (0..5).map(|_| session.cycle(&pending).unwrap()).collect();
        let voltages: Vec<f64> = readings.iter().map(|r| r.voltage).collect();
        let changed: Vec<bool> = readings.iter().map(|r| r.voltage_changed).collect();

        assert_eq!(voltages, vec![1.0, 2.0, 3.0, 3.0, 3.0]);
        assert_eq!(changed, vec![true, true, true, false, false]);
        assert!(pending.is_empty());

        let set_commands: Vec<String> = bench
            .commands_for(SOURCE_RESOURCE)
            .into_iter()
            .filter(|c| c.starts_with("VOLT "))
            .collect();
        assert_eq!(set_commands, vec!["VOLT 1", "VOLT 2", "VOLT 3"]);
        session.shutdown();
    }

    #[test]
    fn cycle_order_is_set_readback_measure() {
        let bench = Arc::new(SimulatedBench::default());
        let pending = PendingVoltages::new();
        let mut session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();
        let before = bench.journal().len();

        pending.push(0.5);
        session.cycle(&pending).unwrap();

        let cycle: Vec<String> = bench.journal()[before..]
            .iter()
            .map(|e| e.command.clone())
            .collect();
        assert_eq!(cycle, vec!["VOLT 0.5", "VOLT?", "READ?"]);
        session.shutdown();
    }

    #[test]
    fn reading_uses_device_report_not_command() {
        let bench = Arc::new(SimulatedBench::default().with_compliance(2.0));
        let pending = PendingVoltages::new();
        pending.push(10.0);
        let mut session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();

        let reading = session.cycle(&pending).unwrap();
        assert_eq!(reading.voltage, 2.0);
        assert!(reading.voltage_changed);
        session.shutdown();
    }

    #[test]
    fn malformed_meter_response_yields_no_reading() {
        let bench = Arc::new(SimulatedBench::default());
        let pending = PendingVoltages::new();
        let mut session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();
        bench.inject(Fault::MalformedResponse {
            resource: METER_RESOURCE.to_string(),
            command: "READ?".to_string(),
            response: "-1.234E-9A".to_string(),
        });

        let result = session.cycle(&pending);
        assert!(matches!(result, Err(crate::error::ScanError::Parse { .. })));
        session.shutdown();
    }

    #[test]
    fn meter_open_failure_closes_source() {
        let bench = Arc::new(SimulatedBench::default());
        bench.inject(Fault::RefuseOpen {
            resource: METER_RESOURCE.to_string(),
        });

        let result = AcquisitionSession::open(bench.clone(), &settings());
        assert!(matches!(
            result,
            Err(crate::error::ScanError::Connection { .. })
        ));
        assert_eq!(bench.open_connections(), 0);
    }

    #[traced_test]
    #[test]
    fn shutdown_continues_past_failures() {
        let bench = Arc::new(SimulatedBench::default());
        let session = AcquisitionSession::open(bench.clone(), &settings()).unwrap();
        bench.inject(Fault::FailCommand {
            resource: SOURCE_RESOURCE.to_string(),
            command: "OUTP OFF".to_string(),
        });
        bench.inject(Fault::FailClose {
            resource: METER_RESOURCE.to_string(),
        });

        session.shutdown();

        assert_eq!(bench.open_connections(), 0);
        assert!(logs_contain("Failed to disable bias output"));
        assert!(logs_contain("Failed to close meter channel"));
    }
}
