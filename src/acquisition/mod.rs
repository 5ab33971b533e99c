//! Acquisition loop.
//!
//! One dedicated thread owns both instrument channels while the loop runs. Each
//! cycle it forwards at most one pending voltage setpoint to the bias source,
//! reads back the source's setpoint, takes one meter reading and publishes it.
//!
//! # Threads
//!
//! - The controlling thread calls [`Acquisition::start`], [`Acquisition::stop`] and
//!   enqueues setpoints through [`Acquisition::enqueue_voltage`] /
//!   [`Acquisition::enqueue_sweep`].
//! - The acquisition thread performs all instrument I/O and sends
//!   [`AcquisitionEvent`]s on an unbounded channel. Receivers must not assume they
//!   run on any particular thread.
//!
//! The run flag is an `AtomicBool` accessed with `SeqCst`. Stopping is cooperative:
//! the flag is checked at the top of each cycle, so [`Acquisition::stop`] blocks until
//! the in-flight cycle (including its I/O) completes.
//!
//! # Failures
//!
//! Any instrument or parse error ends the loop. The source output is disabled, both
//! channels are closed, the run flag reverts to stopped and
//! [`AcquisitionEvent::Failed`] is published. A cycle that fails never produces a
//! [`Reading`].

mod queue;
mod session;

pub use queue::PendingVoltages;
pub use session::AcquisitionSession;

use crate::config::ScanConfig;
use crate::error::{AppResult, ScanError};
use crate::instrument::meter::MeterSetup;
use crate::instrument::{ConnectionOptions, Connector};
use crate::sweep::VoltageSweep;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// One sample produced by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Source setpoint as reported by the source (V)
    pub voltage: f64,
    /// Measured current (A)
    pub current: f64,
    /// Meter timestamp (s since the meter was reset on loop start)
    pub timestamp: f64,
    /// Whether this cycle wrote a new setpoint
    pub voltage_changed: bool,
}

/// Events published by the acquisition thread.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// Both instruments are open and initialized.
    Started,
    /// A new reading.
    Reading(Reading),
    /// The loop ended because it was asked to stop.
    Stopped,
    /// The loop ended on an error (including failure to open a channel).
    Failed(String),
}

/// Connection parameters for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// Resource identifier
    pub resource: String,
    /// Minimum gap between the end of one request and the start of the next
    pub interval: Duration,
    /// Transport options
    pub options: ConnectionOptions,
}

impl ChannelSettings {
    fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            interval: Duration::from_millis(1),
            options: ConnectionOptions::default(),
        }
    }
}

/// Everything the acquisition thread needs to open and run a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Bias source channel
    pub source: ChannelSettings,
    /// Picoammeter channel
    pub meter: ChannelSettings,
    /// Meter configuration applied on start
    pub meter_setup: MeterSetup,
    /// Sleep at the end of every cycle (zero disables it)
    pub cycle_sleep: Duration,
}

impl AcquisitionSettings {
    /// Reference settings (1 ms intervals, default meter setup) for two resources.
    pub fn for_resources(source: impl Into<String>, meter: impl Into<String>) -> Self {
        Self {
            source: ChannelSettings::new(source),
            meter: ChannelSettings::new(meter),
            meter_setup: MeterSetup::default(),
            cycle_sleep: Duration::from_millis(1),
        }
    }

    /// Same gap for both channels.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.source.interval = interval;
        self.meter.interval = interval;
        self
    }

    /// Per-cycle sleep.
    pub fn with_cycle_sleep(mut self, cycle_sleep: Duration) -> Self {
        self.cycle_sleep = cycle_sleep;
        self
    }
}

impl From<&ScanConfig> for AcquisitionSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            source: ChannelSettings {
                resource: config.source.resource.clone(),
                interval: config.source.interval(),
                options: config.source.connection_options(),
            },
            meter: ChannelSettings {
                resource: config.meter.resource.clone(),
                interval: config.meter.interval(),
                options: config.meter.connection_options(),
            },
            meter_setup: config.meter.setup(),
            cycle_sleep: config.acquisition.cycle_sleep(),
        }
    }
}

/// Acquisition loop controller.
///
/// Lifecycle is `Stopped -> Running -> Stopped`. Dropping the controller stops
/// the loop.
pub struct Acquisition {
    connector: Arc<dyn Connector>,
    settings: AcquisitionSettings,
    pending: PendingVoltages,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<AcquisitionEvent>,
}

impl Acquisition {
    /// Create a stopped loop and the receiving end of its event stream.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: AcquisitionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<AcquisitionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        info!(
            connector = connector.name(),
            source = %settings.source.resource,
            meter = %settings.meter.resource,
            "Created acquisition loop"
        );
        let acquisition = Self {
            connector,
            settings,
            pending: PendingVoltages::new(),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            events,
        };
        (acquisition, receiver)
    }

    /// Start the loop on a new thread.
    ///
    /// Channels are opened and initialized on the acquisition thread; failures there
    /// are reported as [`AcquisitionEvent::Failed`] and the loop reverts to stopped.
    ///
    /// # Errors
    ///
    /// [`ScanError::AlreadyRunning`] if the loop is running. Nothing is opened in
    /// that case.
    pub fn start(&self) -> AppResult<()> {
        let mut worker = self.worker.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ScanError::AlreadyRunning);
        }

        // A loop that ended on its own leaves a finished handle behind.
        if let Some(stale) = worker.take() {
            if stale.join().is_err() {
                warn!("Previous acquisition thread panicked");
            }
        }

        let connector = Arc::clone(&self.connector);
        let settings = self.settings.clone();
        let pending = self.pending.clone();
        let running = Arc::clone(&self.running);
        let events = self.events.clone();

        let spawned = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || run_loop(connector, settings, pending, running, events));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!("Started acquisition loop");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(ScanError::Io(e))
            }
        }
    }

    /// Stop the loop and wait for the acquisition thread to finish.
    ///
    /// Blocks for up to one cycle. Stopping a stopped loop does nothing.
    ///
    /// # Errors
    ///
    /// [`ScanError::ThreadPanicked`] if the acquisition thread panicked.
    pub fn stop(&self) -> AppResult<()> {
        let mut worker = self.worker.lock();
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
                return Err(ScanError::ThreadPanicked);
            }
        }

        if was_running {
            info!("Stopped acquisition loop");
        }
        Ok(())
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue one voltage setpoint.
    pub fn enqueue_voltage(&self, volts: f64) {
        debug!(voltage = volts, "Queued voltage setpoint");
        self.pending.push(volts);
    }

    /// Queue every voltage of a sweep, in order. Returns how many were queued.
    pub fn enqueue_sweep(&self, sweep: &VoltageSweep) -> usize {
        let count = self.pending.extend_from_sweep(sweep);
        info!(
            start = sweep.start(),
            end = sweep.end(),
            step = sweep.step(),
            count,
            "Queued voltage sweep"
        );
        count
    }

    /// Setpoints not yet written to the source.
    pub fn pending(&self) -> &PendingVoltages {
        &self.pending
    }

    /// Settings used for each start.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Failed to stop acquisition loop on drop");
        }
    }
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("connector", &self.connector.name())
            .field("settings", &self.settings)
            .field("pending", &self.pending.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_loop(
    connector: Arc<dyn Connector>,
    settings: AcquisitionSettings,
    pending: PendingVoltages,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<AcquisitionEvent>,
) {
    let mut session = match AcquisitionSession::open(connector, &settings) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to open acquisition session");
            running.store(false, Ordering::SeqCst);
            let _ = events.send(AcquisitionEvent::Failed(e.to_string()));
            return;
        }
    };
    let _ = events.send(AcquisitionEvent::Started);

    let mut failure = None;
    while running.load(Ordering::SeqCst) {
        match session.cycle(&pending) {
            Ok(reading) => {
                trace!(
                    voltage = reading.voltage,
                    current = reading.current,
                    timestamp = reading.timestamp,
                    voltage_changed = reading.voltage_changed,
                    "Reading"
                );
                let _ = events.send(AcquisitionEvent::Reading(reading));
            }
            Err(e) => {
                error!(error = %e, "Acquisition cycle failed, ending loop");
                failure = Some(e);
                break;
            }
        }

        if !settings.cycle_sleep.is_zero() {
            thread::sleep(settings.cycle_sleep);
        }
    }

    session.shutdown();
    running.store(false, Ordering::SeqCst);

    let event = match failure {
        Some(e) => AcquisitionEvent::Failed(e.to_string()),
        None => AcquisitionEvent::Stopped,
    };
    let _ = events.send(event);
    debug!("Acquisition thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{SimulatedBench, METER_RESOURCE, SOURCE_RESOURCE};

    #[test]
    fn settings_from_config() {
        let mut config = ScanConfig::default();
        config.meter.interval_ms = 7;
        config.meter.nplc = 1.0;
        config.acquisition.cycle_sleep_ms = 0;

        let settings = AcquisitionSettings::from(&config);
        assert_eq!(settings.source.resource, SOURCE_RESOURCE);
        assert_eq!(settings.meter.resource, METER_RESOURCE);
        assert_eq!(settings.meter.interval, Duration::from_millis(7));
        assert_eq!(settings.source.interval, Duration::from_millis(1));
        assert_eq!(settings.meter_setup.nplc, 1.0);
        assert!(settings.cycle_sleep.is_zero());
    }

    #[test]
    fn new_loop_is_stopped() {
        let bench = Arc::new(SimulatedBench::default());
        let (acquisition, _events) = Acquisition::new(
            bench.clone(),
            AcquisitionSettings::for_resources(SOURCE_RESOURCE, METER_RESOURCE),
        );
        assert!(!acquisition.is_running());
        assert_eq!(bench.open_connections(), 0);
    }

    #[test]
    fn stop_when_stopped_is_noop() {
        let bench = Arc::new(SimulatedBench::default());
        let (acquisition, mut events) = Acquisition::new(
            bench.clone(),
            AcquisitionSettings::for_resources(SOURCE_RESOURCE, METER_RESOURCE),
        );
        acquisition.stop().unwrap();
        acquisition.stop().unwrap();
        assert!(bench.journal().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn enqueue_does_not_need_running_loop() {
        let bench = Arc::new(SimulatedBench::default());
        let (acquisition, _events) = Acquisition::new(
            bench,
            AcquisitionSettings::for_resources(SOURCE_RESOURCE, METER_RESOURCE),
        );
        acquisition.enqueue_voltage(1.5);
        let sweep = VoltageSweep::new(0.0, 0.2, 0.05).unwrap();
        assert_eq!(acquisition.enqueue_sweep(&sweep), 4);
        assert_eq!(acquisition.pending().len(), 5);
        assert_eq!(acquisition.pending().pop(), Some(1.5));
    }
}
