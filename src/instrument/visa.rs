//! VISA transport (GPIB, USB-TMC, LAN) through `visa-rs`.
//!
//! Requires the `instrument_visa` feature and a system VISA library (NI-VISA,
//! Keysight IO Libraries, ...). Each connection owns its own default resource
//! manager, so channels can be opened and closed independently.

use super::{Connection, ConnectionOptions, Connector};
use crate::error::{AppResult, ScanError};
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use tracing::debug;
use visa_rs::prelude::*;

/// Opens VISA sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisaConnector;

impl Connector for VisaConnector {
    fn open(&self, resource: &str, options: &ConnectionOptions) -> AppResult<Box<dyn Connection>> {
        let rm = DefaultRM::new().map_err(|e| ScanError::connection(resource, e))?;
        let id = CString::new(resource).map_err(|e| ScanError::connection(resource, e))?;
        let instrument = rm
            .open(&id.into(), AccessMode::NO_LOCK, options.timeout)
            .map_err(|e| ScanError::connection(resource, e))?;
        debug!(resource, timeout_ms = options.timeout.as_millis() as u64, "Opened VISA session");

        Ok(Box::new(VisaConnection {
            resource: resource.to_string(),
            instrument: Some(BufReader::new(instrument)),
            _rm: rm,
            write_termination: options.write_termination.clone(),
            read_termination: options.read_termination.clone(),
        }))
    }

    fn name(&self) -> &str {
        "visa"
    }
}

// Field order matters: the session must close before its resource manager.
// Reads go through one buffer for the life of the session, so bytes that arrive
// past a terminator are kept for the next read.
struct VisaConnection {
    resource: String,
    instrument: Option<BufReader<Instrument>>,
    _rm: DefaultRM,
    write_termination: String,
    read_termination: String,
}

impl VisaConnection {
    fn instrument(&mut self) -> AppResult<&mut BufReader<Instrument>> {
        let resource = &self.resource;
        self.instrument
            .as_mut()
            .ok_or_else(|| ScanError::communication(resource, "session closed"))
    }

    fn read_line(&mut self) -> AppResult<String> {
        let delimiter = self.read_termination.as_bytes().last().copied().unwrap_or(b'\n');
        let resource = self.resource.clone();
        let instrument = self.instrument()?;

        let mut raw = Vec::new();
        instrument
            .read_until(delimiter, &mut raw)
            .map_err(|e| ScanError::communication(&resource, e))?;
        let text = String::from_utf8(raw).map_err(|e| ScanError::communication(&resource, e))?;

        Ok(text
            .strip_suffix(self.read_termination.as_str())
            .map(str::to_string)
            .unwrap_or(text))
    }
}

impl Connection for VisaConnection {
    fn write(&mut self, command: &str) -> AppResult<()> {
        let message = format!("{}{}", command, self.write_termination);
        let resource = self.resource.clone();
        self.instrument()?
            .get_mut()
            .write_all(message.as_bytes())
            .map_err(|e| ScanError::communication(&resource, e))
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command)?;
        self.read_line()
    }

    fn read(&mut self) -> AppResult<String> {
        self.read_line()
    }

    fn close(&mut self) -> AppResult<()> {
        match self.instrument.take() {
            Some(instrument) => {
                drop(instrument);
                debug!(resource = %self.resource, "Closed VISA session");
                Ok(())
            }
            None => Err(ScanError::communication(&self.resource, "session already closed")),
        }
    }
}
