//! Plot data model for a scan.
//!
//! Two traces are fed from the same reading stream:
//! - current vs. time receives every reading, with x relative to the first
//!   retained reading's timestamp
//! - current vs. voltage receives only readings taken right after a setpoint
//!   change, so each voltage contributes one settled point per visit
//!
//! Rendering is left to the front end.

use crate::acquisition::Reading;

/// Point in plot coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

/// Current-vs-time and current-vs-voltage traces.
#[derive(Debug, Clone, Default)]
pub struct ScanTraces {
    time_origin: Option<f64>,
    current_vs_time: Vec<PlotPoint>,
    current_vs_voltage: Vec<PlotPoint>,
}

impl ScanTraces {
    /// Empty traces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reading to the traces it belongs to.
    pub fn push(&mut self, reading: &Reading) {
        let origin = *self.time_origin.get_or_insert(reading.timestamp);
        self.current_vs_time.push(PlotPoint {
            x: reading.timestamp - origin,
            y: reading.current,
        });

        if reading.voltage_changed {
            self.current_vs_voltage.push(PlotPoint {
                x: reading.voltage,
                y: reading.current,
            });
        }
    }

    /// Current (A) against seconds since the first retained reading.
    pub fn current_vs_time(&self) -> &[PlotPoint] {
        &self.current_vs_time
    }

    /// Current (A) against source voltage (V).
    pub fn current_vs_voltage(&self) -> &[PlotPoint] {
        &self.current_vs_voltage
    }

    /// Drop the time trace. The next reading becomes the new time origin.
    pub fn clear_time_trace(&mut self) {
        self.current_vs_time.clear();
        self.time_origin = None;
    }

    /// Drop the voltage trace.
    pub fn clear_voltage_trace(&mut self) {
        self.current_vs_voltage.clear();
    }
}
