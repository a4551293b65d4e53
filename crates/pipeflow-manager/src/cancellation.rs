//! Delivery bookkeeping for cancellation signals.
//!
//! A signal stays pending until no worker holds a unit of its run anymore.
//! Delivery is at-least-once: the Manager re-sends it to every holder at a
//! bounded rate, and workers ignore duplicates.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use pipeflow_core::{CancellationSignal, RunId};

#[derive(Debug)]
struct PendingCancellation {
    signal: CancellationSignal,
    last_sent: Option<Instant>,
    deliveries: u32,
}

/// Cancellation signals not yet acknowledged by every holder.
#[derive(Debug, Default)]
pub struct CancellationTracker {
    pending: BTreeMap<RunId, PendingCancellation>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new signal. A second signal for the same run is a no-op.
    pub fn raise(&mut self, signal: CancellationSignal) -> bool {
        if self.pending.contains_key(&signal.run_id) {
            return false;
        }
        self.pending.insert(
            signal.run_id.clone(),
            PendingCancellation {
                signal,
                last_sent: None,
                deliveries: 0,
            },
        );
        true
    }

    pub fn is_pending(&self, run_id: &RunId) -> bool {
        self.pending.contains_key(run_id)
    }

    /// Signals whose next delivery is due.
    pub fn due(&self, now: Instant, resend_interval: Duration) -> Vec<CancellationSignal> {
        self.pending
            .values()
            .filter(|p| p.last_sent.map_or(true, |at| now.duration_since(at) >= resend_interval))
            .map(|p| p.signal.clone())
            .collect()
    }

    pub fn record_delivery(&mut self, run_id: &RunId, now: Instant) {
        if let Some(pending) = self.pending.get_mut(run_id) {
            pending.last_sent = Some(now);
            pending.deliveries += 1;
        }
    }

    /// Stop tracking a run whose holders have all reported. Returns how many
    /// delivery rounds it took.
    pub fn settle(&mut self, run_id: &RunId) -> Option<u32> {
        self.pending.remove(run_id).map(|p| p.deliveries)
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.pending.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeflow_core::CancelReason;

    fn signal(run: &str) -> CancellationSignal {
        CancellationSignal::raise(RunId::new(run), CancelReason::Requested)
    }

    #[test]
    fn test_raise_is_idempotent() {
        let mut tracker = CancellationTracker::new();
        assert!(tracker.raise(signal("r1")));
        assert!(!tracker.raise(signal("r1")));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_resend_rate() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        let mut tracker = CancellationTracker::new();
        tracker.raise(signal("r1"));

        assert_eq!(tracker.due(start, interval).len(), 1);
        tracker.record_delivery(&RunId::new("r1"), start);
        assert!(tracker.due(start + Duration::from_millis(500), interval).is_empty());
        assert_eq!(tracker.due(start + interval, interval).len(), 1);
    }

    #[test]
    fn test_settle() {
        let mut tracker = CancellationTracker::new();
        tracker.raise(signal("r1"));
        tracker.record_delivery(&RunId::new("r1"), Instant::now());
        assert_eq!(tracker.settle(&RunId::new("r1")), Some(1));
        assert!(!tracker.is_pending(&RunId::new("r1")));
        assert!(tracker.is_empty());
    }
}
