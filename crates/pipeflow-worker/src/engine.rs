//! Step execution engines and cooperative interruption.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use pipeflow_core::{DatasetHandle, DatasetRef, FailureDiagnostic, RunId, StepSpec, UnitId};

/// Returned by [`Interrupt::checkpoint`] once the unit must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution interrupted")]
pub struct StopExecution;

/// Stop request for the unit currently executing.
///
/// Engines call [`Interrupt::checkpoint`] at safe points and propagate the
/// error with `?`, or await [`Interrupt::raised`] next to their own work.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A safe point: `Err(StopExecution)` once interruption was requested.
    pub fn checkpoint(&self) -> Result<(), StopExecution> {
        if self.is_raised() {
            Err(StopExecution)
        } else {
            Ok(())
        }
    }

    /// Completes when interruption is requested.
    pub async fn raised(&self) {
        self.token.cancelled().await
    }
}

/// What an engine reports for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Completed(Vec<DatasetHandle>),
    Failed(FailureDiagnostic),
    /// Stopped at a safe point; partial outputs were discarded.
    Interrupted,
}

impl From<StopExecution> for StepResult {
    fn from(_: StopExecution) -> Self {
        Self::Interrupted
    }
}

/// One unit as handed to an engine.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: RunId,
    pub unit_id: UnitId,
    pub step: StepSpec,
    pub attempt: u32,
}

impl StepInvocation {
    /// Input datasets in the order the step declares them.
    pub fn inputs(&self) -> &[DatasetRef] {
        &self.step.inputs
    }

    pub fn outputs(&self) -> &[DatasetRef] {
        &self.step.outputs
    }
}

/// Runs the computation bound to a step.
#[async_trait]
pub trait StepEngine: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation, interrupt: &Interrupt) -> StepResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_to(limit: u32, interrupt: &Interrupt) -> Result<u32, StopExecution> {
        let mut n = 0;
        while n < limit {
            interrupt.checkpoint()?;
            n += 1;
            if n == 3 {
                interrupt.raise();
            }
        }
        Ok(n)
    }

    #[test]
    fn test_checkpoint_stops_work() {
        let interrupt = Interrupt::new();
        assert_eq!(count_to(2, &interrupt), Ok(2));
        assert!(!interrupt.is_raised());

        assert_eq!(count_to(10, &interrupt), Err(StopExecution));
        assert_eq!(StepResult::from(StopExecution), StepResult::Interrupted);
    }

    #[tokio::test]
    async fn test_raised_wakes_waiters() {
        let interrupt = Interrupt::new();
        let waiter = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move { interrupt.raised().await })
        };
        interrupt.raise();
        waiter.await.unwrap();
        assert!(interrupt.checkpoint().is_err());
    }
}
