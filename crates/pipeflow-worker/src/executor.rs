//! Executes one unit while watching the transport for stop requests.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use pipeflow_core::UnitOutcome;
use pipeflow_proto::Payload;
use pipeflow_transport::Transport;

use crate::engine::{Interrupt, StepEngine, StepInvocation, StepResult};
use crate::{WorkerConfig, WorkerError};

/// How one unit ended on this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: UnitOutcome,

    /// The manager asked this worker to shut down meanwhile.
    pub shutdown: bool,
}

/// Turn what the engine returned into the outcome to report.
///
/// Once the run was cancelled, whatever the engine produced is discarded.
pub fn outcome_of(result: StepResult, run_cancelled: bool) -> UnitOutcome {
    if run_cancelled {
        return UnitOutcome::Cancelled;
    }
    match result {
        StepResult::Completed(outputs) => UnitOutcome::Complete { outputs },
        StepResult::Failed(diagnostic) => UnitOutcome::Failed { diagnostic },
        StepResult::Interrupted => UnitOutcome::Cancelled,
    }
}

/// Run `invocation` on `engine`.
///
/// Every `cancel_poll_interval` the worker's inbox is drained:
/// - a cancellation for this unit's run interrupts the engine,
/// - cancellations for other runs are ignored,
/// - a shutdown starts the grace period, after which the engine is
///   interrupted, and abandoned if it still has not stopped after
///   `interrupt_timeout`.
pub async fn execute_unit(
    transport: &dyn Transport,
    engine: &dyn StepEngine,
    config: &WorkerConfig,
    invocation: &StepInvocation,
) -> Result<Execution, WorkerError> {
    let interrupt = Interrupt::new();
    let work = engine.execute(invocation, &interrupt);
    tokio::pin!(work);

    let mut poll = tokio::time::interval(config.cancel_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut run_cancelled = false;
    let mut grace_deadline: Option<Instant> = None;
    let mut abandon_at: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            result = &mut work => break Some(result),
            _ = poll.tick() => {
                while let Some(envelope) = transport.try_recv()? {
                    let kind = envelope.kind();
                    match envelope.payload {
                        Some(Payload::Cancel(cancel)) if cancel.run_id == invocation.run_id.as_str() => {
                            if !run_cancelled {
                                info!(
                                    run_id = %invocation.run_id,
                                    unit_id = %invocation.unit_id,
                                    reason = %cancel.reason,
                                    "Cancellation received"
                                );
                                run_cancelled = true;
                                interrupt.raise();
                            }
                        }
                        Some(Payload::Cancel(cancel)) => {
                            debug!(run_id = %cancel.run_id, "Cancellation for another run ignored");
                        }
                        Some(Payload::Shutdown(shutdown)) => {
                            if grace_deadline.is_none() {
                                let grace = if shutdown.grace_ms > 0 {
                                    Duration::from_millis(shutdown.grace_ms)
                                } else {
                                    config.shutdown_grace
                                };
                                info!(
                                    unit_id = %invocation.unit_id,
                                    grace_ms = grace.as_millis() as u64,
                                    "Shutdown requested, finishing current unit"
                                );
                                grace_deadline = Some(Instant::now() + grace);
                            }
                        }
                        Some(Payload::Assign(other)) => {
                            warn!(unit_id = %other.unit_id, "Assignment received while busy, dropping it");
                        }
                        _ => warn!(kind, "Unexpected message while busy"),
                    }
                }

                let now = Instant::now();
                if grace_deadline.is_some_and(|deadline| now >= deadline) && abandon_at.is_none() {
                    warn!(unit_id = %invocation.unit_id, "Grace period over, interrupting unit");
                    interrupt.raise();
                    abandon_at = Some(now + config.interrupt_timeout);
                }
                if abandon_at.is_some_and(|at| now >= at) {
                    warn!(unit_id = %invocation.unit_id, "Unit ignored interruption, abandoning it");
                    break None;
                }
            }
        }
    };

    let outcome = match result {
        Some(result) => outcome_of(result, run_cancelled),
        None => UnitOutcome::Cancelled,
    };
    Ok(Execution {
        outcome,
        shutdown: grace_deadline.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeflow_core::{DatasetHandle, FailureDiagnostic};

    #[test]
    fn test_outcome_of() {
        let outputs = vec![DatasetHandle::new("raw", "/data/raw")];
        assert_eq!(
            outcome_of(StepResult::Completed(outputs.clone()), false),
            UnitOutcome::Complete { outputs: outputs.clone() }
        );
        assert_eq!(
            outcome_of(StepResult::Interrupted, false),
            UnitOutcome::Cancelled
        );

        let diagnostic = FailureDiagnostic::step_failed("boom");
        assert_eq!(
            outcome_of(StepResult::Failed(diagnostic.clone()), false),
            UnitOutcome::Failed { diagnostic }
        );
    }

    #[test]
    fn test_cancelled_run_discards_outputs() {
        let outputs = vec![DatasetHandle::new("raw", "/data/raw")];
        assert_eq!(
            outcome_of(StepResult::Completed(outputs), true),
            UnitOutcome::Cancelled
        );
    }
}
