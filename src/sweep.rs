//! Voltage sweep generation.
//!
//! A sweep is the half-open range `start, start + step, start + 2*step, ...`
//! strictly below `end`. Values are computed as `start + i * step` (no running
//! accumulation), so the last value may undershoot `end` by less than `step`, and
//! no value ever equals or exceeds `end`.

use crate::error::{AppResult, ScanError};
use serde::{Deserialize, Serialize};

/// Largest number of voltages a sweep may produce.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Ordered list of target voltages, described by its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageSweep {
    start: f64,
    end: f64,
    step: f64,
}

impl VoltageSweep {
    /// Sweep from `start` (inclusive) to `end` (exclusive) in increments of `step`.
    ///
    /// Fails if any bound is not finite, `step` is not positive, or the sweep
    /// would produce more than [`MAX_SWEEP_POINTS`] voltages.
    pub fn new(start: f64, end: f64, step: f64) -> AppResult<Self> {
        if !(start.is_finite() && end.is_finite() && step.is_finite()) {
            return Err(ScanError::Configuration(format!(
                "Sweep bounds must be finite (start {}, end {}, step {})",
                start, end, step
            )));
        }
        if step <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "Sweep step must be positive, got {}",
                step
            )));
        }
        let span = (end - start) / step;
        if !span.is_finite() || span > MAX_SWEEP_POINTS as f64 {
            return Err(ScanError::Configuration(format!(
                "Sweep from {} to {} in steps of {} exceeds {} points",
                start, end, step, MAX_SWEEP_POINTS
            )));
        }
        Ok(Self { start, end, step })
    }

    /// First voltage.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Increment between consecutive voltages.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Materialize the sweep.
    pub fn values(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.value_at(i)).collect()
    }

    /// Number of voltages in the sweep.
    pub fn len(&self) -> usize {
        if self.end <= self.start {
            return 0;
        }
        let mut count = ((self.end - self.start) / self.step)
            .ceil()
            .min(MAX_SWEEP_POINTS as f64) as usize;
        // Rounding can put the last candidate on or past `end`.
        while count > 0 && self.value_at(count - 1) >= self.end {
            count -= 1;
        }
        count
    }

    fn value_at(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }

    /// Whether the sweep produces no voltages.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-12, "{:?} vs {:?}", actual, expected);
        }
    }

    #[test]
    fn quarter_volt_steps() {
        let sweep = VoltageSweep::new(0.0, 0.2, 0.05).unwrap();
        let values = sweep.values();
        assert_close(&values, &[0.0, 0.05, 0.10, 0.15]);
        assert!(values.iter().all(|&v| v < 0.2));
    }

    #[test]
    fn tenth_steps_do_not_reach_end() {
        let sweep = VoltageSweep::new(0.0, 0.3, 0.1).unwrap();
        assert_close(&sweep.values(), &[0.0, 0.1, 0.2]);
    }

    #[test]
    fn end_never_reached_even_when_divisible() {
        let sweep = VoltageSweep::new(1.0, 3.0, 0.5).unwrap();
        assert_close(&sweep.values(), &[1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn reference_default_sweep_length() {
        let values = VoltageSweep::new(0.0, 30.0, 0.05).unwrap().values();
        assert_eq!(values.len(), 600);
        assert!(values.last().copied().unwrap() < 30.0);
    }

    #[test]
    fn empty_when_end_not_above_start() {
        assert!(VoltageSweep::new(2.0, 2.0, 0.1).unwrap().is_empty());
        assert!(VoltageSweep::new(3.0, 1.0, 0.1).unwrap().values().is_empty());
    }

    #[test]
    fn step_larger_than_span_yields_start_only() {
        assert_eq!(VoltageSweep::new(0.0, 1.0, 5.0).unwrap().values(), vec![0.0]);
    }

    #[test]
    fn len_matches_values_without_materializing() {
        let cases = [(0.0, 0.3, 0.1), (0.0, 0.6, 0.2), (-1.0, 1.0, 0.7), (0.0, 30.0, 0.05)];
        for (start, end, step) in cases {
            let sweep = VoltageSweep::new(start, end, step).unwrap();
            let values = sweep.values();
            assert_eq!(sweep.len(), values.len());
            assert!(values.iter().all(|&v| v < end));
        }
    }

    #[test]
    fn oversized_sweep_rejected() {
        assert!(matches!(
            VoltageSweep::new(0.0, 1e300, 1e-300),
            Err(ScanError::Configuration(_))
        ));
        assert!(VoltageSweep::new(0.0, 1.0, 1e-7).is_err());
        assert_eq!(VoltageSweep::new(0.0, 1.0, 1e-5).unwrap().len(), 100_000);
    }

    #[test]
    fn invalid_step_rejected() {
        assert!(VoltageSweep::new(0.0, 1.0, 0.0).is_err());
        assert!(VoltageSweep::new(0.0, 1.0, -0.1).is_err());
        assert!(VoltageSweep::new(0.0, f64::INFINITY, 0.1).is_err());
    }
}
