//! Core domain errors.

use thiserror::Error;

use crate::ids::{DatasetRef, PipelineId, StepId};

/// Core domain errors for pipeflow.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task unit not found in its run graph.
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The pipeline definition cannot be expanded.
    #[error(transparent)]
    MalformedPipeline(#[from] MalformedPipelineError),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Reasons a pipeline definition cannot be turned into a run graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPipelineError {
    #[error("pipeline '{0}' has no steps")]
    Empty(PipelineId),

    #[error("step '{0}' is defined more than once")]
    DuplicateStep(StepId),

    #[error("dataset '{dataset}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        dataset: DatasetRef,
        first: StepId,
        second: StepId,
    },

    #[error("step '{step}' reads '{dataset}', which no step produces and the run does not provide")]
    DanglingInput { step: StepId, dataset: DatasetRef },

    #[error("cycle detected in pipeline involving step '{0}'")]
    Cycle(StepId),
}
