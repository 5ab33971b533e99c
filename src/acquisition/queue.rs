//! Pending voltage setpoints shared between the controlling thread and the loop.

use crate::sweep::VoltageSweep;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Thread-safe FIFO of voltage setpoints.
///
/// The controlling thread pushes; the acquisition thread pops, one value per
/// cycle. Clones share the same queue. Values left in the queue survive a
/// stop/start of the loop.
#[derive(Debug, Clone, Default)]
pub struct PendingVoltages {
    inner: Arc<Mutex<VecDeque<f64>>>,
}

impl PendingVoltages {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one setpoint.
    pub fn push(&self, volts: f64) {
        self.inner.lock().push_back(volts);
    }

    /// Append every value of `sweep`, in order. Returns how many were queued.
    pub fn extend_from_sweep(&self, sweep: &VoltageSweep) -> usize {
        let values = sweep.values();
        let count = values.len();
        self.inner.lock().extend(values);
        count
    }

    /// Remove and return the oldest setpoint.
    pub fn pop(&self) -> Option<f64> {
        self.inner.lock().pop_front()
    }

    /// Number of queued setpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every queued setpoint. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock();
        let count = queue.len();
        queue.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = PendingVoltages::new();
        queue.push(1.0);
        queue.push(2.0);
        queue.push(3.0);
        assert_eq!(queue.pop(), Some(1.0));
        assert_eq!(queue.pop(), Some(2.0));
        assert_eq!(queue.pop(), Some(3.0));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn sweep_queued_in_order() {
        let queue = PendingVoltages::new();
        let sweep = VoltageSweep::new(0.0, 1.0, 0.25).unwrap();
        assert_eq!(queue.extend_from_sweep(&sweep), 4);
        assert_eq!(queue.pop(), Some(0.0));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn producer_and_consumer_on_different_threads() {
        let queue = PendingVoltages::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            for i in 0..100 {
                producer.push(i as f64);
            }
        });
        handle.join().unwrap();

        let drained: Vec<f64> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, (0..100).map(|i| i as f64).collect::<Vec<_>>());
    }
}
