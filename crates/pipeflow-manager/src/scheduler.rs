//! Assignment policy: which ready unit goes to which idle worker.

use pipeflow_core::{Rank, RunId, UnitId};

use crate::runs::RunTable;

/// One unit to hand to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub run_id: RunId,
    pub unit_id: UnitId,
    pub rank: Rank,
}

/// Pair ready units with idle workers.
///
/// Units are taken in run-submission order, then step-definition order;
/// workers lowest rank first. Units left without a worker stay Pending for
/// the next iteration.
pub fn plan(runs: &RunTable, idle: &[Rank]) -> Vec<Dispatch> {
    runs.iter()
        .flat_map(|active| active.graph.ready_units())
        .zip(idle.iter().copied())
        .map(|(unit, rank)| Dispatch {
            run_id: unit.run_id.clone(),
            unit_id: unit.id.clone(),
            rank,
        })
        .collect()
}
