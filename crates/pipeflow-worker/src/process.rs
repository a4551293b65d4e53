//! Engine that runs one external program per step.
//!
//! The program is started as `<program> [args...] <step_id>` with the unit
//! described in the environment:
//!
//! | variable | value |
//! |----------|-------|
//! | `PIPEFLOW_RUN_ID`, `PIPEFLOW_UNIT_ID`, `PIPEFLOW_STEP_ID` | identities |
//! | `PIPEFLOW_ATTEMPT` | 1 for the first assignment |
//! | `PIPEFLOW_INPUTS`, `PIPEFLOW_OUTPUTS` | dataset paths, joined like `PATH` |
//! | `PIPEFLOW_PARAM_<NAME>` | one per step parameter |
//!
//! Datasets of a run live under `<data_dir>/<run_id>/<dataset>`. Run ids and
//! dataset names must be relative paths without `.` or `..` components; a
//! unit naming anything else fails before its program is started.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use pipeflow_core::{DatasetHandle, DatasetRef, FailureDiagnostic, RunId};

use crate::engine::{Interrupt, StepEngine, StepInvocation, StepResult};
use crate::EngineError;

pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    data_dir: PathBuf,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            data_dir: data_dir.into(),
        }
    }

    /// Arguments placed before the step id.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn run_dir(&self, run_id: &RunId) -> Result<PathBuf, EngineError> {
        Ok(self.data_dir.join(contained(run_id.as_str())?))
    }

    /// Where a dataset of a run is stored.
    pub fn location(&self, run_id: &RunId, dataset: &DatasetRef) -> Result<PathBuf, EngineError> {
        Ok(self.run_dir(run_id)?.join(contained(dataset.as_str())?))
    }

    fn layout(&self, invocation: &StepInvocation) -> Result<Layout, EngineError> {
        let locate = |datasets: &[DatasetRef]| {
            datasets
                .iter()
                .map(|d| self.location(&invocation.run_id, d))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Layout {
            run_dir: self.run_dir(&invocation.run_id)?,
            inputs: locate(invocation.inputs())?,
            outputs: locate(invocation.outputs())?,
        })
    }

    async fn spawn(&self, invocation: &StepInvocation, layout: &Layout) -> Result<Child, EngineError> {
        let run_dir = &layout.run_dir;
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(|source| EngineError::Workspace {
                path: run_dir.clone(),
                source,
            })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(invocation.step.id.as_str())
            .env("PIPEFLOW_RUN_ID", invocation.run_id.as_str())
            .env("PIPEFLOW_UNIT_ID", invocation.unit_id.as_str())
            .env("PIPEFLOW_STEP_ID", invocation.step.id.as_str())
            .env("PIPEFLOW_ATTEMPT", invocation.attempt.to_string())
            .env("PIPEFLOW_INPUTS", joined(&layout.inputs)?)
            .env("PIPEFLOW_OUTPUTS", joined(&layout.outputs)?)
            .current_dir(run_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in &invocation.step.params {
            cmd.env(param_var(name), value);
        }

        debug!(command = ?cmd, "Spawning step program");
        cmd.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })
    }

}

/// Resolved paths of one unit, all under the data directory.
struct Layout {
    run_dir: PathBuf,
    inputs: Vec<PathBuf>,
    outputs: Vec<PathBuf>,
}

impl Layout {
    async fn discard_outputs(&self) {
        for path in &self.outputs {
            if let Err(e) = remove(path).await {
                warn!(path = %path.display(), error = %e, "Failed to discard partial output");
            }
        }
    }
}

/// `name` as a relative path that cannot leave the directory it is joined to.
fn contained(name: &str) -> Result<&Path, EngineError> {
    let path = Path::new(name);
    let normal = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if normal {
        Ok(path)
    } else {
        Err(EngineError::DatasetPath(format!("{name:?} escapes the data directory")))
    }
}

fn joined(paths: &[PathBuf]) -> Result<OsString, EngineError> {
    std::env::join_paths(paths).map_err(|e| EngineError::DatasetPath(e.to_string()))
}

/// `PIPEFLOW_PARAM_` followed by the name upper-cased, with anything that is
/// not alphanumeric replaced by `_`.
fn param_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PIPEFLOW_PARAM_{suffix}")
}

async fn remove(path: &Path) -> std::io::Result<()> {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl StepEngine for ProcessEngine {
    async fn execute(&self, invocation: &StepInvocation, interrupt: &Interrupt) -> StepResult {
        if let Err(stop) = interrupt.checkpoint() {
            return stop.into();
        }

        let layout = match self.layout(invocation) {
            Ok(layout) => layout,
            Err(e) => return StepResult::Failed(FailureDiagnostic::step_failed(e.to_string())),
        };
        let mut child = match self.spawn(invocation, &layout).await {
            Ok(child) => child,
            Err(e) => return StepResult::Failed(FailureDiagnostic::step_failed(e.to_string())),
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    let outputs = invocation
                        .outputs()
                        .iter()
                        .zip(&layout.outputs)
                        .map(|(d, location)| DatasetHandle::new(d.clone(), location.display().to_string()))
                        .collect();
                    StepResult::Completed(outputs)
                }
                Ok(status) => StepResult::Failed(FailureDiagnostic::step_failed(format!(
                    "step {} exited with {}",
                    invocation.step.id, status
                ))),
                Err(e) => StepResult::Failed(FailureDiagnostic::step_failed(EngineError::Wait(e).to_string())),
            },
            _ = interrupt.raised() => {
                info!(unit_id = %invocation.unit_id, "Killing step program");
                if let Err(e) = child.kill().await {
                    warn!(unit_id = %invocation.unit_id, error = %e, "Failed to kill step program");
                }
                layout.discard_outputs().await;
                StepResult::Interrupted
            }
        }
    }
}
