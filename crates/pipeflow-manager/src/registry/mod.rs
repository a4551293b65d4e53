//! What the Manager consumes from the outside world: the run registry and
//! the pipeline definition store.
//!
//! The registry is the source of truth for runs. The Manager only reads new
//! runs and stop requests from it and writes back statuses and unit outcomes.

mod dir;
mod memory;

use async_trait::async_trait;

use pipeflow_core::{FailureDiagnostic, PipelineDefinition, PipelineId, Run, RunId, Status, UnitId, UnitOutcome};

use crate::RegistryError;

pub use dir::{DirRegistry, OutcomeRecord, StatusRecord};
pub use memory::MemoryRegistry;

/// Persistent record of runs and their progress.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Runs waiting to be picked up, oldest first.
    ///
    /// A run stays listed until a status other than Pending was recorded for
    /// it, so the Manager must tolerate seeing the same run more than once.
    async fn list_pending_runs(&self) -> Result<Vec<Run>, RegistryError>;

    /// Runs recorded as Running, oldest first, with status Running.
    ///
    /// After a restart these are the runs the previous Manager was driving.
    async fn list_active_runs(&self) -> Result<Vec<Run>, RegistryError>;

    /// Unit outcomes recorded for a run, in recording order.
    async fn list_unit_outcomes(&self, run_id: &RunId) -> Result<Vec<(UnitId, UnitOutcome)>, RegistryError>;

    /// Runs an operator asked to stop that are not terminal yet.
    async fn list_cancel_requests(&self) -> Result<Vec<RunId>, RegistryError>;

    async fn record_status(
        &self,
        run_id: &RunId,
        status: Status,
        diagnostic: Option<&FailureDiagnostic>,
    ) -> Result<(), RegistryError>;

    async fn record_unit_outcome(
        &self,
        run_id: &RunId,
        unit_id: &UnitId,
        outcome: &UnitOutcome,
    ) -> Result<(), RegistryError>;
}

/// Read-only source of pipeline definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// `Ok(None)` when no pipeline has this id.
    async fn get_definition(&self, pipeline_id: &PipelineId) -> Result<Option<PipelineDefinition>, RegistryError>;
}
