//! Task units and their outcomes.

use serde::{Deserialize, Serialize};

use crate::{DatasetRef, MalformedPipelineError, Rank, RunId, Status, StepSpec, UnitId};

/// A produced dataset and where the dataset store put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub dataset: DatasetRef,
    pub location: String,
}

impl DatasetHandle {
    pub fn new(dataset: impl Into<DatasetRef>, location: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            location: location.into(),
        }
    }
}

/// Diagnostic attached to failed units and to failed or cancelled runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDiagnostic {
    /// Machine-readable category, e.g. `step_failed`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl FailureDiagnostic {
    pub const STEP_FAILED: &'static str = "step_failed";
    pub const MALFORMED_PIPELINE: &'static str = "malformed_pipeline";
    pub const UNKNOWN_PIPELINE: &'static str = "unknown_pipeline";
    pub const CANCELLED: &'static str = "cancelled";
    pub const NO_LIVE_WORKERS: &'static str = "no_live_workers";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Failure reported by the step-execution engine.
    pub fn step_failed(message: impl Into<String>) -> Self {
        Self::new(Self::STEP_FAILED, message)
    }
}

impl From<&MalformedPipelineError> for FailureDiagnostic {
    fn from(err: &MalformedPipelineError) -> Self {
        Self::new(Self::MALFORMED_PIPELINE, err.to_string())
    }
}

/// Terminal outcome of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Complete { outputs: Vec<DatasetHandle> },
    Failed { diagnostic: FailureDiagnostic },
    Cancelled,
}

impl UnitOutcome {
    /// The terminal status this outcome leads to.
    pub fn status(&self) -> Status {
        match self {
            Self::Complete { .. } => Status::Complete,
            Self::Failed { .. } => Status::Failed,
            Self::Cancelled => Status::Cancelled,
        }
    }
}

/// One schedulable step invocation of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUnit {
    pub id: UnitId,
    pub run_id: RunId,
    pub step: StepSpec,

    /// Units that produce this unit's inputs, in definition order.
    pub predecessors: Vec<UnitId>,

    pub status: Status,

    /// Worker currently (or last) holding the unit.
    pub assigned_to: Option<Rank>,

    /// How many times the unit has been handed to a worker.
    pub attempts: u32,

    /// Set once the unit is terminal.
    pub outcome: Option<UnitOutcome>,
}

impl TaskUnit {
    pub fn new(run_id: RunId, step: StepSpec, predecessors: Vec<UnitId>) -> Self {
        Self {
            id: UnitId::for_step(&run_id, &step.id),
            run_id,
            step,
            predecessors,
            status: Status::Pending,
            assigned_to: None,
            attempts: 0,
            outcome: None,
        }
    }

    /// Ordered input dataset references.
    pub fn inputs(&self) -> &[DatasetRef] {
        &self.step.inputs
    }

    /// Output dataset references.
    pub fn outputs(&self) -> &[DatasetRef] {
        &self.step.outputs
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
