//! In-memory registry and definition store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use pipeflow_core::{FailureDiagnostic, PipelineDefinition, PipelineId, Run, RunId, Status, UnitId, UnitOutcome};

use super::{DefinitionStore, RunRegistry};
use crate::RegistryError;

#[derive(Debug, Clone)]
struct RunRecord {
    run: Run,
    diagnostic: Option<FailureDiagnostic>,
    /// Every status recorded by the Manager, in order.
    history: Vec<Status>,
    outcomes: Vec<(UnitId, UnitOutcome)>,
}

#[derive(Default)]
struct Inner {
    /// Submission order.
    runs: Vec<RunRecord>,
    index: HashMap<RunId, usize>,
    definitions: HashMap<PipelineId, PipelineDefinition>,
    /// Number of upcoming `record_status` calls that fail.
    failing_writes: u32,
}

impl Inner {
    fn record_mut(&mut self, run_id: &RunId) -> Result<&mut RunRecord, RegistryError> {
        let i = *self
            .index
            .get(run_id)
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))?;
        Ok(&mut self.runs[i])
    }

    fn record(&self, run_id: &RunId) -> Option<&RunRecord> {
        self.index.get(run_id).map(|&i| &self.runs[i])
    }
}

/// Registry and definition store kept in process memory.
///
/// Used by tests and when embedding a Manager in another program.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_definition(&self, definition: PipelineDefinition) {
        let mut inner = self.inner.write().await;
        inner.definitions.insert(definition.id.clone(), definition);
    }

    /// Submit a run. The run is listed as pending until the Manager records
    /// another status for it.
    pub async fn submit(&self, run: Run) {
        let mut inner = self.inner.write().await;
        if inner.index.contains_key(&run.id) {
            return;
        }
        let i = inner.runs.len();
        inner.index.insert(run.id.clone(), i);
        inner.runs.push(RunRecord {
            run,
            diagnostic: None,
            history: Vec::new(),
            outcomes: Vec::new(),
        });
    }

    /// Ask for a run to be stopped.
    pub async fn request_cancel(&self, run_id: &RunId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        inner.record_mut(run_id)?.run.cancel_requested = true;
        Ok(())
    }

    /// Make the next `count` status writes fail.
    pub async fn fail_next_status_writes(&self, count: u32) {
        self.inner.write().await.failing_writes = count;
    }

    pub async fn status(&self, run_id: &RunId) -> Option<Status> {
        self.inner.read().await.record(run_id).map(|r| r.run.status)
    }

    pub async fn diagnostic(&self, run_id: &RunId) -> Option<FailureDiagnostic> {
        self.inner.read().await.record(run_id).and_then(|r| r.diagnostic.clone())
    }

    pub async fn status_history(&self, run_id: &RunId) -> Vec<Status> {
        self.inner
            .read()
            .await
            .record(run_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Unit outcomes of a run in the order they were recorded.
    pub async fn outcomes(&self, run_id: &RunId) -> Vec<(UnitId, UnitOutcome)> {
        self.inner
            .read()
            .await
            .record(run_id)
            .map(|r| r.outcomes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunRegistry for MemoryRegistry {
    async fn list_pending_runs(&self) -> Result<Vec<Run>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.run.status == Status::Pending)
            .map(|r| r.run.clone())
            .collect())
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.run.status == Status::Running)
            .map(|r| r.run.clone())
            .collect())
    }

    async fn list_unit_outcomes(&self, run_id: &RunId) -> Result<Vec<(UnitId, UnitOutcome)>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .record(run_id)
            .map(|r| r.outcomes.clone())
            .unwrap_or_default())
    }

    async fn list_cancel_requests(&self) -> Result<Vec<RunId>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.run.cancel_requested && !r.run.status.is_terminal())
            .map(|r| r.run.id.clone())
            .collect())
    }

    async fn record_status(
        &self,
        run_id: &RunId,
        status: Status,
        diagnostic: Option<&FailureDiagnostic>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(RegistryError::Io(std::io::Error::other("injected write failure")));
        }
        let record = inner.record_mut(run_id)?;
        record.run.status = status;
        record.history.push(status);
        if diagnostic.is_some() {
            record.diagnostic = diagnostic.cloned();
        }
        Ok(())
    }

    async fn record_unit_outcome(
        &self,
        run_id: &RunId,
        unit_id: &UnitId,
        outcome: &UnitOutcome,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        inner
            .record_mut(run_id)?
            .outcomes
            .push((unit_id.clone(), outcome.clone()));
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for MemoryRegistry {
    async fn get_definition(&self, pipeline_id: &PipelineId) -> Result<Option<PipelineDefinition>, RegistryError> {
        Ok(self.inner.read().await.definitions.get(pipeline_id).cloned())
    }
}
