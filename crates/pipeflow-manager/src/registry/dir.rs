//! Registry kept as a spool directory of JSON files.
//!
//! ```text
//! <root>/pipelines/<pipeline_id>.json   PipelineDefinition
//! <root>/runs/<run_id>.json             Run, written by the submission path
//! <root>/cancel/<run_id>                stop request marker
//! <root>/status/<run_id>.json           StatusRecord, written by the Manager
//! <root>/outcomes/<run_id>.jsonl        one OutcomeRecord per line
//! ```
//!
//! A run is pending while it has no status file, and active while its
//! status file says Running.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use pipeflow_core::{FailureDiagnostic, PipelineDefinition, PipelineId, Run, RunId, Status, UnitId, UnitOutcome};

use super::{DefinitionStore, RunRegistry};
use crate::RegistryError;

const PIPELINES: &str = "pipelines";
const RUNS: &str = "runs";
const CANCEL: &str = "cancel";
const STATUS: &str = "status";
const OUTCOMES: &str = "outcomes";

/// Last status the Manager recorded for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<FailureDiagnostic>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a run's outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub unit_id: UnitId,
    pub outcome: UnitOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Registry and definition store backed by a directory.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    /// Open (and create if needed) the spool directory at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        for dir in [PIPELINES, RUNS, CANCEL, STATUS, OUTCOMES] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, dir: &str, id: &str, extension: &str) -> Result<PathBuf, RegistryError> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(RegistryError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(dir).join(format!("{id}{extension}")))
    }

    /// Store a pipeline definition.
    pub async fn put_definition(&self, definition: &PipelineDefinition) -> Result<(), RegistryError> {
        let path = self.path(PIPELINES, definition.id.as_str(), ".json")?;
        write_atomic(&path, &serde_json::to_vec_pretty(definition)?).await
    }

    /// Submit a run.
    pub async fn submit(&self, run: &Run) -> Result<(), RegistryError> {
        let path = self.path(RUNS, run.id.as_str(), ".json")?;
        write_atomic(&path, &serde_json::to_vec_pretty(run)?).await
    }

    /// Ask for a run to be stopped.
    pub async fn request_cancel(&self, run_id: &RunId) -> Result<(), RegistryError> {
        let path = self.path(CANCEL, run_id.as_str(), "")?;
        fs::write(path, b"").await?;
        Ok(())
    }

    pub async fn status(&self, run_id: &RunId) -> Result<Option<StatusRecord>, RegistryError> {
        let path = self.path(STATUS, run_id.as_str(), ".json")?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unit outcomes of a run in the order they were recorded.
    pub async fn outcomes(&self, run_id: &RunId) -> Result<Vec<OutcomeRecord>, RegistryError> {
        let path = self.path(OUTCOMES, run_id.as_str(), ".jsonl")?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(RegistryError::from))
            .collect()
    }

    /// Names of the files in one spool subdirectory, sorted.
    async fn entries(&self, dir: &str) -> Result<Vec<String>, RegistryError> {
        let mut names = Vec::new();
        let mut reader = fs::read_dir(self.root.join(dir)).await?;
        while let Some(entry) = reader.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Submitted runs whose recorded status satisfies `wanted`, oldest
    /// first. A run without a status file is Pending.
    async fn runs_where(&self, wanted: fn(Status) -> bool) -> Result<Vec<Run>, RegistryError> {
        let mut runs = Vec::new();
        for name in self.entries(RUNS).await? {
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let status = self
                .status(&RunId::new(stem))
                .await?
                .map_or(Status::Pending, |record| record.status);
            if !wanted(status) {
                continue;
            }

            let bytes = fs::read(self.root.join(RUNS).join(&name)).await?;
            let mut run: Run = match serde_json::from_slice(&bytes) {
                Ok(run) => run,
                Err(e) => {
                    warn!(file = %name, error = %e, "Skipping unreadable run record");
                    continue;
                }
            };
            run.status = status;
            if fs::try_exists(self.path(CANCEL, stem, "")?).await? {
                run.cancel_requested = true;
            }
            runs.push(run);
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }
}

/// Write to a fresh temporary file in the same directory, sync it, then
/// rename it over the target. Temporary names start with a dot, so
/// listings skip them.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<(), RegistryError> {
        let dir = path
            .parent()
            .ok_or_else(|| RegistryError::InvalidId(path.display().to_string()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl RunRegistry for DirRegistry {
    async fn list_pending_runs(&self) -> Result<Vec<Run>, RegistryError> {
        self.runs_where(|status| status == Status::Pending).await
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>, RegistryError> {
        self.runs_where(|status| status == Status::Running).await
    }

    async fn list_unit_outcomes(&self, run_id: &RunId) -> Result<Vec<(UnitId, UnitOutcome)>, RegistryError> {
        Ok(self
            .outcomes(run_id)
            .await?
            .into_iter()
            .map(|record| (record.unit_id, record.outcome))
            .collect())
    }

    async fn list_cancel_requests(&self) -> Result<Vec<RunId>, RegistryError> {
        let mut requests = Vec::new();
        for name in self.entries(CANCEL).await? {
            let run_id = RunId::new(name);
            let terminal = self
                .status(&run_id)
                .await?
                .is_some_and(|record| record.status.is_terminal());
            if !terminal {
                requests.push(run_id);
            }
        }
        Ok(requests)
    }

    async fn record_status(
        &self,
        run_id: &RunId,
        status: Status,
        diagnostic: Option<&FailureDiagnostic>,
    ) -> Result<(), RegistryError> {
        let record = StatusRecord {
            status,
            diagnostic: diagnostic.cloned(),
            updated_at: Utc::now(),
        };
        let path = self.path(STATUS, run_id.as_str(), ".json")?;
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?).await
    }

    async fn record_unit_outcome(
        &self,
        run_id: &RunId,
        unit_id: &UnitId,
        outcome: &UnitOutcome,
    ) -> Result<(), RegistryError> {
        let record = OutcomeRecord {
            unit_id: unit_id.clone(),
            outcome: outcome.clone(),
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let path = self.path(OUTCOMES, run_id.as_str(), ".jsonl")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for DirRegistry {
    async fn get_definition(&self, pipeline_id: &PipelineId) -> Result<Option<PipelineDefinition>, RegistryError> {
        let path = self.path(PIPELINES, pipeline_id.as_str(), ".json")?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
