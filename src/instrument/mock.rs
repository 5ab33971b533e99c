//! Simulated bench.
//!
//! Provides a [`Connector`] that answers for the two instruments of the bias scan,
//! so the acquisition loop can run without a GPIB controller.
//!
//! # Simulated instruments
//!
//! - Bias source (default `GPIB0::10::INSTR`): `*RST`, `OUTP ON|OFF`, `VOLT <v>`,
//!   `VOLT?`. Setpoints are clamped to the compliance limit, and `VOLT?` reports
//!   the clamped value.
//! - Picoammeter (default `GPIB0::14::INSTR`): `*RST`, `CURR:NPLC`, `CURR:RANG`,
//!   `CONF:CURR`, `SYST:ZCH`, `SYST:ZCOR:ACQ`, `SYST:ZCOR`, `READ?`. The current is
//!   the source voltage across a load resistor, plus a fixed offset until a zero
//!   correction has been acquired and enabled.
//!
//! Operations land in a shared journal with start and finish instants. The journal
//! keeps only the most recent [`DEFAULT_JOURNAL_CAPACITY`] entries unless
//! [`SimulatedBench::with_journal_capacity`] says otherwise. Faults can be injected
//! at any time through [`SimulatedBench::inject`].

use super::{Connection, ConnectionOptions, Connector};
use crate::error::{AppResult, ScanError};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Resource of the reference bias source.
pub const SOURCE_RESOURCE: &str = "GPIB0::10::INSTR";

/// Resource of the reference picoammeter.
pub const METER_RESOURCE: &str = "GPIB0::14::INSTR";

/// Offset current reported before zero correction (A).
pub const UNCORRECTED_OFFSET: f64 = 1.5e-12;

/// Journal entry recorded for `read()` calls.
pub const READ_MARKER: &str = "<read>";

/// Journal entries kept by a bench built with [`SimulatedBench::new`].
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// Fault injected into the bench. Faults stay active until cleared.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// `open` of this resource fails with a connection error.
    RefuseOpen { resource: String },
    /// This command fails at the transport.
    FailCommand { resource: String, command: String },
    /// This query is answered with an empty line.
    EmptyResponse { resource: String, command: String },
    /// This query is answered with `response` instead of the real answer.
    MalformedResponse {
        resource: String,
        command: String,
        response: String,
    },
    /// `close` of this resource reports an error. The connection is released anyway.
    FailClose { resource: String },
}

/// One operation as seen by the bench.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Resource the operation was addressed to
    pub resource: String,
    /// Command text (without terminator), or [`READ_MARKER`]
    pub command: String,
    /// When the bench received the operation
    pub started: Instant,
    /// When the bench completed it
    pub finished: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Device {
    Source,
    Meter,
}

#[derive(Debug, Clone)]
struct Profile {
    source_resource: String,
    meter_resource: String,
    latency: Duration,
    load_ohms: f64,
    compliance_volts: f64,
    noise_amps: f64,
    journal_capacity: usize,
}

#[derive(Debug)]
struct SourceState {
    output: bool,
    setpoint: f64,
}

#[derive(Debug)]
struct MeterState {
    reset_at: Instant,
    nplc: f64,
    range: f64,
    configured: bool,
    zero_check: bool,
    zero_acquired: bool,
    zero_correct: bool,
}

impl MeterState {
    fn reset() -> Self {
        Self {
            reset_at: Instant::now(),
            nplc: 1.0,
            range: 2e-2,
            configured: false,
            zero_check: false,
            zero_acquired: false,
            zero_correct: false,
        }
    }
}

#[derive(Debug)]
struct BenchState {
    source: SourceState,
    meter: MeterState,
    pending: [Option<String>; 2],
    journal: VecDeque<JournalEntry>,
    faults: Vec<Fault>,
    open_connections: usize,
}

impl BenchState {
    fn pending_slot(&mut self, device: Device) -> &mut Option<String> {
        match device {
            Device::Source => &mut self.pending[0],
            Device::Meter => &mut self.pending[1],
        }
    }

    fn log(&mut self, capacity: usize, entry: JournalEntry) {
        if capacity == 0 {
            return;
        }
        while self.journal.len() >= capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(entry);
    }
}

/// Simulated bias source + picoammeter pair.
///
/// Cloning shares the same instruments and journal.
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    profile: Profile,
    state: Arc<Mutex<BenchState>>,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new(SOURCE_RESOURCE, METER_RESOURCE)
    }
}

impl SimulatedBench {
    /// Bench answering on the given resource names.
    ///
    /// Defaults: 10 GΩ load, 50 V compliance, no latency, no noise.
    pub fn new(source_resource: &str, meter_resource: &str) -> Self {
        Self {
            profile: Profile {
                source_resource: source_resource.to_string(),
                meter_resource: meter_resource.to_string(),
                latency: Duration::ZERO,
                load_ohms: 1e10,
                compliance_volts: 50.0,
                noise_amps: 0.0,
                journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            },
            state: Arc::new(Mutex::new(BenchState {
                source: SourceState {
                    output: false,
                    setpoint: 0.0,
                },
                meter: MeterState::reset(),
                pending: [None, None],
                journal: VecDeque::new(),
                faults: Vec::new(),
                open_connections: 0,
            })),
        }
    }

    /// Time each operation takes on the simulated bus.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.profile.latency = latency;
        self
    }

    /// Resistance between source output and meter input.
    pub fn with_load_resistance(mut self, ohms: f64) -> Self {
        self.profile.load_ohms = ohms;
        self
    }

    /// Largest magnitude the source will accept as a setpoint.
    pub fn with_compliance(mut self, volts: f64) -> Self {
        self.profile.compliance_volts = volts;
        self
    }

    /// Peak amplitude of uniform noise added to each current reading.
    pub fn with_noise(mut self, amps: f64) -> Self {
        self.profile.noise_amps = amps;
        self
    }

    /// Number of most recent operations the journal keeps. Zero disables it.
    pub fn with_journal_capacity(mut self, entries: usize) -> Self {
        self.profile.journal_capacity = entries;
        self
    }

    /// Activate a fault.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Remove all active faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Snapshot of the retained operations, oldest first.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.iter().cloned().collect()
    }

    /// Commands sent to `resource`, in order.
    pub fn commands_for(&self, resource: &str) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| entry.resource == resource)
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// Number of connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Whether the source output is enabled.
    pub fn source_output(&self) -> bool {
        self.state.lock().source.output
    }

    /// Source setpoint after clamping.
    pub fn source_setpoint(&self) -> f64 {
        self.state.lock().source.setpoint
    }

    /// Whether the meter is configured and zero-corrected.
    pub fn meter_ready(&self) -> bool {
        let state = self.state.lock();
        state.meter.configured && state.meter.zero_correct && !state.meter.zero_check
    }

    fn device_for(&self, resource: &str) -> Option<Device> {
        if resource == self.profile.source_resource {
            Some(Device::Source)
        } else if resource == self.profile.meter_resource {
            Some(Device::Meter)
        } else {
            None
        }
    }
}

impl Connector for SimulatedBench {
    fn open(
        &self,
        resource: &str,
        _options: &ConnectionOptions,
    ) -> AppResult<Box<dyn Connection>> {
        let mut state = self.state.lock();
        let refused = state.faults.iter().any(|fault| {
            matches!(fault, Fault::RefuseOpen { resource: r } if r == resource)
        });
        if refused {
            return Err(ScanError::connection(resource, "resource refused connection"));
        }
        let device = self
            .device_for(resource)
            .ok_or_else(|| ScanError::connection(resource, "no instrument at this address"))?;
        state.open_connections += 1;

        Ok(Box::new(SimulatedConnection {
            resource: resource.to_string(),
            device,
            profile: self.profile.clone(),
            state: Arc::clone(&self.state),
            open: true,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

struct SimulatedConnection {
    resource: String,
    device: Device,
    profile: Profile,
    state: Arc<Mutex<BenchState>>,
    open: bool,
}

impl SimulatedConnection {
    /// Run one operation: wait out the bus latency, then apply it under the lock.
    fn operate<T>(
        &mut self,
        command: &str,
        apply: impl FnOnce(&Profile, Device, &mut BenchState) -> AppResult<T>,
    ) -> AppResult<T> {
        if !self.open {
            return Err(ScanError::communication(&self.resource, "connection closed"));
        }
        let started = Instant::now();
        if !self.profile.latency.is_zero() {
            thread::sleep(self.profile.latency);
        }

        let mut state = self.state.lock();
        let failed = state.faults.iter().any(|fault| {
            matches!(fault, Fault::FailCommand { resource, command: c }
                if *resource == self.resource && c == command)
        });
        let result = if failed {
            Err(ScanError::communication(
                &self.resource,
                format!("bus error on '{}'", command),
            ))
        } else {
            apply(&self.profile, self.device, &mut state)
        };
        let entry = JournalEntry {
            resource: self.resource.clone(),
            command: command.to_string(),
            started,
            finished: Instant::now(),
        };
        state.log(self.profile.journal_capacity, entry);
        result
    }

    fn substitute(&self, state: &BenchState, command: &str) -> Option<String> {
        state.faults.iter().find_map(|fault| match fault {
            Fault::EmptyResponse { resource, command: c }
                if *resource == self.resource && c == command =>
            {
                Some(String::new())
            }
            Fault::MalformedResponse {
                resource,
                command: c,
                response,
            } if *resource == self.resource && c == command => Some(response.clone()),
            _ => None,
        })
    }
}

impl Connection for SimulatedConnection {
    fn write(&mut self, command: &str) -> AppResult<()> {
        let resource = self.resource.clone();
        self.operate(command, |profile, device, state| {
            let output = execute(profile, device, state, command)
                .map_err(|message| ScanError::communication(&resource, message))?;
            *state.pending_slot(device) = output;
            Ok(())
        })
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        let resource = self.resource.clone();
        let substitute = self.substitute(&self.state.lock(), command);
        self.operate(command, |profile, device, state| {
            let output = execute(profile, device, state, command)
                .map_err(|message| ScanError::communication(&resource, message))?;
            let response = substitute
                .or(output)
                .ok_or_else(|| ScanError::communication(&resource, "query timed out"))?;
            Ok(format!("{}\n", response))
        })
    }

    fn read(&mut self) -> AppResult<String> {
        let resource = self.resource.clone();
        self.operate(READ_MARKER, |_, device, state| {
            state
                .pending_slot(device)
                .take()
                .map(|response| format!("{}\n", response))
                .ok_or_else(|| ScanError::communication(&resource, "read timed out"))
        })
    }

    fn close(&mut self) -> AppResult<()> {
        if !self.open {
            return Err(ScanError::communication(&self.resource, "already closed"));
        }
        self.open = false;
        let mut state = self.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
        let failed = state.faults.iter().any(|fault| {
            matches!(fault, Fault::FailClose { resource } if *resource == self.resource)
        });
        if failed {
            return Err(ScanError::communication(&self.resource, "error releasing session"));
        }
        Ok(())
    }
}

/// Apply one command to the simulated device, returning its output, if any.
fn execute(
    profile: &Profile,
    device: Device,
    state: &mut BenchState,
    command: &str,
) -> Result<Option<String>, String> {
    let mut words: VecDeque<&str> = command.split_whitespace().collect();
    let header = words.pop_front().unwrap_or_default().to_uppercase();
    let argument = words.pop_front();

    if header == "*IDN?" {
        return Ok(Some(match device {
            Device::Source => "Simulated,Bias Source,0,1.0".to_string(),
            Device::Meter => "Simulated,Picoammeter,0,1.0".to_string(),
        }));
    }

    match device {
        Device::Source => execute_source(profile, &mut state.source, &header, argument),
        Device::Meter => {
            let source_volts = if state.source.output {
                state.source.setpoint
            } else {
                0.0
            };
            execute_meter(profile, &mut state.meter, source_volts, &header, argument)
        }
    }
}

fn execute_source(
    profile: &Profile,
    source: &mut SourceState,
    header: &str,
    argument: Option<&str>,
) -> Result<Option<String>, String> {
    match (header, argument) {
        ("*RST", None) => {
            source.output = false;
            source.setpoint = 0.0;
            Ok(None)
        }
        ("OUTP", Some(state)) => {
            source.output = parse_switch(state)?;
            Ok(None)
        }
        ("VOLT", Some(value)) => {
            let volts: f64 = value
                .parse()
                .map_err(|_| format!("invalid voltage '{}'", value))?;
            source.setpoint = volts.clamp(-profile.compliance_volts, profile.compliance_volts);
            Ok(None)
        }
        ("VOLT?", None) => Ok(Some(format!("{:+.6E}", source.setpoint))),
        _ => Err(format!("undefined header '{}'", header)),
    }
}

fn execute_meter(
    profile: &Profile,
    meter: &mut MeterState,
    source_volts: f64,
    header: &str,
    argument: Option<&str>,
) -> Result<Option<String>, String> {
    match (header, argument) {
        ("*RST", None) => {
            *meter = MeterState::reset();
            Ok(None)
        }
        ("CURR:NPLC", Some(value)) => {
            meter.nplc = value
                .parse()
                .map_err(|_| format!("invalid NPLC '{}'", value))?;
            Ok(None)
        }
        ("CURR:RANG", Some(value)) => {
            meter.range = value
                .parse()
                .map_err(|_| format!("invalid range '{}'", value))?;
            Ok(None)
        }
        ("CONF:CURR", None) => {
            meter.configured = true;
            Ok(None)
        }
        ("SYST:ZCH", Some(state)) => {
            meter.zero_check = parse_switch(state)?;
            Ok(None)
        }
        ("SYST:ZCOR:ACQ", None) => {
            if !meter.zero_check {
                return Err("settings conflict: zero check is off".to_string());
            }
            meter.zero_acquired = true;
            Ok(None)
        }
        ("SYST:ZCOR", Some(state)) => {
            let enable = parse_switch(state)?;
            if enable && !meter.zero_acquired {
                return Err("settings conflict: no zero reference".to_string());
            }
            meter.zero_correct = enable;
            Ok(None)
        }
        ("READ?", None) => {
            let mut current = if meter.zero_check {
                0.0
            } else {
                source_volts / profile.load_ohms
            };
            if !meter.zero_correct {
                current += UNCORRECTED_OFFSET;
            }
            if profile.noise_amps > 0.0 {
                current += rand::thread_rng().gen_range(-profile.noise_amps..=profile.noise_amps);
            }
            let seconds = meter.reset_at.elapsed().as_secs_f64();
            Ok(Some(format!("{:+.6E}A,{:+.6E},+0.000000E+00", current, seconds)))
        }
        _ => Err(format!("undefined header '{}'", header)),
    }
}

fn parse_switch(state: &str) -> Result<bool, String> {
    match state.to_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        other => Err(format!("invalid switch state '{}'", other)),
    }
}
