//! Runs the Manager is currently driving.

use std::collections::HashSet;

use pipeflow_core::{RunGraph, RunId};

/// One active run.
#[derive(Debug)]
pub struct ActiveRun {
    pub graph: RunGraph,

    /// Set once the terminal status is in the registry.
    pub status_persisted: bool,
}

impl ActiveRun {
    pub fn run_id(&self) -> &RunId {
        self.graph.run_id()
    }
}

/// Active runs in submission order, plus every run id already absorbed.
#[derive(Debug, Default)]
pub struct RunTable {
    runs: Vec<ActiveRun>,
    known: HashSet<RunId>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the run was already absorbed (active or retired).
    pub fn knows(&self, run_id: &RunId) -> bool {
        self.known.contains(run_id)
    }

    /// Mark a run as absorbed without making it active.
    pub fn remember(&mut self, run_id: RunId) {
        self.known.insert(run_id);
    }

    /// Start driving a run. Keeps submission order: creation time, then
    /// arrival.
    pub fn insert(&mut self, graph: RunGraph) {
        self.known.insert(graph.run_id().clone());

        let created_at = graph.run().created_at;
        let at = self
            .runs
            .partition_point(|r| r.graph.run().created_at <= created_at);
        self.runs.insert(
            at,
            ActiveRun {
                graph,
                status_persisted: false,
            },
        );
    }

    pub fn get(&self, run_id: &RunId) -> Option<&ActiveRun> {
        self.runs.iter().find(|r| r.run_id() == run_id)
    }

    pub fn get_mut(&mut self, run_id: &RunId) -> Option<&mut ActiveRun> {
        self.runs.iter_mut().find(|r| r.run_id() == run_id)
    }

    /// Active runs in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveRun> {
        self.runs.iter()
    }

    /// Stop driving a run. It stays known.
    pub fn retire(&mut self, run_id: &RunId) -> Option<ActiveRun> {
        let i = self.runs.iter().position(|r| r.run_id() == run_id)?;
        Some(self.runs.remove(i))
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
