//! Run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DatasetRef, PipelineId, RunId, Status};

/// A request to execute one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,

    /// Pipeline to execute.
    pub pipeline_id: PipelineId,

    /// Who submitted this run.
    pub owner: String,

    /// Current run status.
    #[serde(default)]
    pub status: Status,

    /// When the run was submitted.
    pub created_at: DateTime<Utc>,

    /// Set by the submission path when a stop was requested before pickup.
    #[serde(default)]
    pub cancel_requested: bool,

    /// Datasets provided to the run from outside the pipeline.
    #[serde(default)]
    pub inputs: Vec<DatasetRef>,
}

impl Run {
    /// Create a new pending Run.
    pub fn new(pipeline_id: impl Into<PipelineId>, owner: impl Into<String>) -> Self {
        Self {
            id: RunId::generate(),
            pipeline_id: pipeline_id.into(),
            owner: owner.into(),
            status: Status::Pending,
            created_at: Utc::now(),
            cancel_requested: false,
            inputs: Vec::new(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<RunId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the submission time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Builder method to add an external input dataset.
    pub fn with_input(mut self, dataset: impl Into<DatasetRef>) -> Self {
        self.inputs.push(dataset.into());
        self
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
