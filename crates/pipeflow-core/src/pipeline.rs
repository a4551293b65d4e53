//! Pipeline definitions as handed over by the definition store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{DatasetRef, PipelineId, StepId};

/// One step of a pipeline: what it reads and what it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step identity, unique within the pipeline.
    pub id: StepId,

    /// Input slots, in the order the engine receives them.
    #[serde(default)]
    pub inputs: Vec<DatasetRef>,

    /// Output slots.
    #[serde(default)]
    pub outputs: Vec<DatasetRef>,

    /// Engine-specific parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StepSpec {
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    /// Builder method to add an input slot.
    pub fn reads(mut self, dataset: impl Into<DatasetRef>) -> Self {
        self.inputs.push(dataset.into());
        self
    }

    /// Builder method to add an output slot.
    pub fn writes(mut self, dataset: impl Into<DatasetRef>) -> Self {
        self.outputs.push(dataset.into());
        self
    }

    /// Builder method to add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A pipeline: steps in definition order.
///
/// Dependencies are implied by datasets: a step depends on whichever step
/// writes one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: PipelineId,
    pub steps: Vec<StepSpec>,
}

impl PipelineDefinition {
    pub fn new(id: impl Into<PipelineId>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// Builder method to append a step.
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}
