//! Cancellation signals.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{RunId, UnitId};

/// Why a run is being stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// External stop request from the registry.
    Requested,
    /// A unit of the run failed.
    UnitFailed { unit_id: UnitId },
    /// A unit of the run was cancelled on its worker.
    UnitCancelled { unit_id: UnitId },
    /// The cluster has no live worker left to run the remaining units.
    NoLiveWorkers,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stop requested"),
            Self::UnitFailed { unit_id } => write!(f, "unit {} failed", unit_id),
            Self::UnitCancelled { unit_id } => write!(f, "unit {} cancelled", unit_id),
            Self::NoLiveWorkers => write!(f, "no live workers"),
        }
    }
}

/// Stop-execution signal scoped to exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationSignal {
    pub run_id: RunId,
    pub reason: CancelReason,
}

impl CancellationSignal {
    /// Raise a cancellation against `run_id`.
    pub fn raise(run_id: RunId, reason: CancelReason) -> Self {
        Self { run_id, reason }
    }

    /// Whether the signal targets `run_id`.
    pub fn targets(&self, run_id: &RunId) -> bool {
        &self.run_id == run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_is_scoped_to_its_run() {
        let signal = CancellationSignal::raise(RunId::new("r1"), CancelReason::Requested);
        assert!(signal.targets(&RunId::new("r1")));
        assert!(!signal.targets(&RunId::new("r2")));
    }

    #[test]
    fn test_reason_display() {
        let reason = CancelReason::UnitFailed {
            unit_id: UnitId::new("r1/b"),
        };
        assert_eq!(reason.to_string(), "unit r1/b failed");
    }
}
