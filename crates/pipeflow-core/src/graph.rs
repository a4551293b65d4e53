//! Run state machine: one run and the dependency graph of its units.
//!
//! Every status change of a run or of one of its units goes through
//! [`RunGraph`]. The Manager owns one graph per active run and is its only
//! writer.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::{
    CancelReason, CancellationSignal, CoreError, DatasetRef, FailureDiagnostic,
    MalformedPipelineError, PipelineDefinition, Rank, Run, RunId, Status, StepId, TaskUnit,
    UnitId, UnitOutcome,
};

/// Effect of applying an outcome (or a cancellation) to a run graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advance {
    /// False when the target was already terminal and nothing changed.
    pub applied: bool,

    /// New run status, if the run changed state.
    pub run_status: Option<Status>,

    /// Sibling units forced to Cancelled by this step.
    pub cancelled_units: Vec<UnitId>,

    /// Raised when the run stopped early; the Manager must deliver it to
    /// every worker still holding one of the run's units.
    pub signal: Option<CancellationSignal>,
}

impl Advance {
    fn ignored() -> Self {
        Self::default()
    }

    fn applied() -> Self {
        Self {
            applied: true,
            ..Self::default()
        }
    }

    /// Whether this step moved the run into a terminal state.
    pub fn finished_run(&self) -> bool {
        self.run_status.is_some_and(|s| s.is_terminal())
    }
}

/// A run together with its expanded task units.
#[derive(Debug, Clone)]
pub struct RunGraph {
    run: Run,
    /// Units in step-definition order.
    units: Vec<TaskUnit>,
    index: HashMap<UnitId, usize>,
    diagnostic: Option<FailureDiagnostic>,
}

impl RunGraph {
    /// Expand `run` against its pipeline definition.
    ///
    /// Units keep the definition's step order. A unit's predecessors are the
    /// units writing its inputs; inputs nobody writes must be provided by the
    /// run itself.
    pub fn expand(run: Run, definition: &PipelineDefinition) -> Result<Self, MalformedPipelineError> {
        let steps = &definition.steps;
        if steps.is_empty() {
            return Err(MalformedPipelineError::Empty(definition.id.clone()));
        }

        let mut seen: HashSet<&StepId> = HashSet::with_capacity(steps.len());
        for step in steps {
            if !seen.insert(&step.id) {
                return Err(MalformedPipelineError::DuplicateStep(step.id.clone()));
            }
        }

        let mut producers: HashMap<&DatasetRef, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            for output in &step.outputs {
                match producers.get(output) {
                    Some(&first) if first != i => {
                        return Err(MalformedPipelineError::DuplicateOutput {
                            dataset: output.clone(),
                            first: steps[first].id.clone(),
                            second: step.id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        producers.insert(output, i);
                    }
                }
            }
        }

        let external: HashSet<&DatasetRef> = run.inputs.iter().collect();

        // Edge direction: producer -> consumer.
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        let mut predecessors: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            graph.add_node(i);
            let mut preds = Vec::new();
            for input in &step.inputs {
                match producers.get(input) {
                    Some(&p) => {
                        graph.add_edge(p, i, ());
                        if !preds.contains(&p) {
                            preds.push(p);
                        }
                    }
                    None if external.contains(input) => {}
                    None => {
                        return Err(MalformedPipelineError::DanglingInput {
                            step: step.id.clone(),
                            dataset: input.clone(),
                        });
                    }
                }
            }
            preds.sort_unstable();
            predecessors.push(preds);
        }

        // Self loops count as cycles too.
        toposort(&graph, None)
            .map_err(|cycle| MalformedPipelineError::Cycle(steps[cycle.node_id()].id.clone()))?;

        let units: Vec<TaskUnit> = steps
            .iter()
            .zip(predecessors)
            .map(|(step, preds)| {
                let preds = preds
                    .into_iter()
                    .map(|p| UnitId::for_step(&run.id, &steps[p].id))
                    .collect();
                TaskUnit::new(run.id.clone(), step.clone(), preds)
            })
            .collect();
        let index = units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.id.clone(), i))
            .collect();

        Ok(Self {
            run,
            units,
            index,
            diagnostic: None,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.id
    }

    pub fn status(&self) -> Status {
        self.run.status
    }

    pub fn units(&self) -> &[TaskUnit] {
        &self.units
    }

    pub fn unit(&self, id: &UnitId) -> Option<&TaskUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    /// Diagnostic of a failed or cancelled run.
    pub fn diagnostic(&self) -> Option<&FailureDiagnostic> {
        self.diagnostic.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }

    fn position(&self, id: &UnitId) -> Result<usize, CoreError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| CoreError::UnitNotFound(id.to_string()))
    }

    /// Move the run from Pending to Running.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.run.status = self.run.status.transition(Status::Running)?;
        Ok(())
    }

    /// Pending units whose predecessors are all Complete, in definition order.
    ///
    /// Recomputed from scratch on every call.
    pub fn ready_units(&self) -> Vec<&TaskUnit> {
        if self.run.status != Status::Running {
            return Vec::new();
        }
        self.units
            .iter()
            .filter(|unit| unit.status == Status::Pending && self.predecessors_complete(unit))
            .collect()
    }

    fn predecessors_complete(&self, unit: &TaskUnit) -> bool {
        unit.predecessors
            .iter()
            .all(|p| self.unit(p).is_some_and(|u| u.status == Status::Complete))
    }

    /// Hand a ready unit to the worker at `rank`.
    pub fn assign(&mut self, unit_id: &UnitId, rank: Rank) -> Result<(), CoreError> {
        let i = self.position(unit_id)?;
        if self.run.status != Status::Running || !self.predecessors_complete(&self.units[i]) {
            return Err(CoreError::InvalidInput(format!("unit {} is not ready", unit_id)));
        }
        let unit = &mut self.units[i];
        unit.status = unit.status.transition(Status::Running)?;
        unit.assigned_to = Some(rank);
        unit.attempts += 1;
        Ok(())
    }

    /// Put a running unit back to Pending after its worker was lost.
    pub fn requeue(&mut self, unit_id: &UnitId) -> Result<(), CoreError> {
        let i = self.position(unit_id)?;
        let unit = &mut self.units[i];
        unit.status = unit.status.transition(Status::Pending)?;
        unit.assigned_to = None;
        Ok(())
    }

    /// Re-apply an outcome recorded before the Manager restarted.
    ///
    /// Only Complete and Failed outcomes are replayed. A unit recorded as
    /// Cancelled while its run went on is simply run again.
    pub fn replay(&mut self, unit_id: &UnitId, outcome: UnitOutcome) -> Result<Advance, CoreError> {
        if outcome == UnitOutcome::Cancelled || self.is_terminal() {
            return Ok(Advance::ignored());
        }
        let i = self.position(unit_id)?;
        if self.units[i].is_terminal() {
            return Ok(Advance::ignored());
        }
        let unit = &mut self.units[i];
        unit.status = unit.status.transition(Status::Running)?;
        unit.attempts += 1;
        self.advance(unit_id, outcome)
    }

    /// Apply a terminal outcome to one unit.
    ///
    /// Idempotent: an outcome for a unit that is already terminal is ignored.
    /// A Failed or Cancelled outcome ends the run and cancels every
    /// non-terminal sibling.
    pub fn advance(&mut self, unit_id: &UnitId, outcome: UnitOutcome) -> Result<Advance, CoreError> {
        let i = self.position(unit_id)?;
        if self.units[i].is_terminal() {
            return Ok(Advance::ignored());
        }

        let next = outcome.status();
        let unit = &mut self.units[i];
        unit.status = unit.status.transition(next)?;
        let diagnostic = match &outcome {
            UnitOutcome::Failed { diagnostic } => Some(diagnostic.clone()),
            _ => None,
        };
        unit.outcome = Some(outcome);

        match next {
            Status::Complete => {
                if self.units.iter().all(|u| u.status == Status::Complete) {
                    self.run.status = self.run.status.transition(Status::Complete)?;
                    return Ok(Advance {
                        applied: true,
                        run_status: Some(Status::Complete),
                        ..Advance::default()
                    });
                }
                Ok(Advance::applied())
            }
            Status::Failed => self.terminate(
                Status::Failed,
                CancelReason::UnitFailed {
                    unit_id: unit_id.clone(),
                },
                diagnostic,
            ),
            _ => {
                let reason = CancelReason::UnitCancelled {
                    unit_id: unit_id.clone(),
                };
                let diagnostic = FailureDiagnostic::new(FailureDiagnostic::CANCELLED, reason.to_string());
                self.terminate(Status::Cancelled, reason, Some(diagnostic))
            }
        }
    }

    /// Cancel the whole run. No-op on a terminal run.
    pub fn cancel(&mut self, reason: CancelReason) -> Result<Advance, CoreError> {
        if self.is_terminal() {
            return Ok(Advance::ignored());
        }
        let diagnostic = FailureDiagnostic::new(FailureDiagnostic::CANCELLED, reason.to_string());
        self.terminate(Status::Cancelled, reason, Some(diagnostic))
    }

    /// Fail the whole run for a reason outside any single unit.
    pub fn fail(&mut self, diagnostic: FailureDiagnostic, reason: CancelReason) -> Result<Advance, CoreError> {
        if self.is_terminal() {
            return Ok(Advance::ignored());
        }
        self.terminate(Status::Failed, reason, Some(diagnostic))
    }

    fn terminate(
        &mut self,
        status: Status,
        reason: CancelReason,
        diagnostic: Option<FailureDiagnostic>,
    ) -> Result<Advance, CoreError> {
        self.run.status = self.run.status.transition(status)?;
        self.diagnostic = diagnostic;

        let mut cancelled_units = Vec::new();
        for unit in self.units.iter_mut().filter(|u| !u.is_terminal()) {
            unit.status = unit.status.transition(Status::Cancelled)?;
            unit.outcome = Some(UnitOutcome::Cancelled);
            cancelled_units.push(unit.id.clone());
        }

        Ok(Advance {
            applied: true,
            run_status: Some(status),
            cancelled_units,
            signal: Some(CancellationSignal::raise(self.run.id.clone(), reason)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatasetHandle, StepSpec};

    fn chain() -> PipelineDefinition {
        PipelineDefinition::new("chain")
            .with_step(StepSpec::new("a").reads("raw").writes("x"))
            .with_step(StepSpec::new("b").reads("x").writes("y"))
            .with_step(StepSpec::new("c").reads("y").writes("z"))
    }

    fn run() -> Run {
        Run::new("chain", "tester").with_id("r1").with_input("raw")
    }

    fn started(definition: &PipelineDefinition) -> RunGraph {
        let mut graph = RunGraph::expand(run(), definition).unwrap();
        graph.start().unwrap();
        graph
    }

    fn complete(graph: &mut RunGraph, unit: &str) -> Advance {
        let id = UnitId::new(unit);
        graph.assign(&id, Rank::new(1)).unwrap();
        graph
            .advance(
                &id,
                UnitOutcome::Complete {
                    outputs: vec![DatasetHandle::new("out", "/tmp/out")],
                },
            )
            .unwrap()
    }

    fn ready_ids(graph: &RunGraph) -> Vec<String> {
        graph
            .ready_units()
            .into_iter()
            .map(|u| u.id.to_string())
            .collect()
    }

    #[test]
    fn test_expand_chain_predecessors() {
        let graph = RunGraph::expand(run(), &chain()).unwrap();
        let preds: Vec<Vec<String>> = graph
            .units()
            .iter()
            .map(|u| u.predecessors.iter().map(|p| p.to_string()).collect())
            .collect();
        assert_eq!(preds, vec![vec![], vec!["r1/a".to_string()], vec!["r1/b".to_string()]]);
        assert_eq!(graph.status(), Status::Pending);
    }

    #[test]
    fn test_nothing_ready_before_start() {
        let graph = RunGraph::expand(run(), &chain()).unwrap();
        assert!(graph.ready_units().is_empty());
    }

    #[test]
    fn test_expand_rejects_cycle() {
        let def = PipelineDefinition::new("loop")
            .with_step(StepSpec::new("a").reads("y").writes("x"))
            .with_step(StepSpec::new("b").reads("x").writes("y"));
        let err = RunGraph::expand(run(), &def).unwrap_err();
        assert!(matches!(err, MalformedPipelineError::Cycle(_)));
    }

    #[test]
    fn test_expand_rejects_self_dependency() {
        let def = PipelineDefinition::new("self")
            .with_step(StepSpec::new("a").reads("x").writes("x"));
        let err = RunGraph::expand(run(), &def).unwrap_err();
        assert_eq!(err, MalformedPipelineError::Cycle(StepId::new("a")));
    }

    #[test]
    fn test_expand_rejects_dangling_input() {
        let def = PipelineDefinition::new("dangling")
            .with_step(StepSpec::new("a").reads("missing").writes("x"));
        let err = RunGraph::expand(run(), &def).unwrap_err();
        assert_eq!(
            err,
            MalformedPipelineError::DanglingInput {
                step: StepId::new("a"),
                dataset: DatasetRef::new("missing"),
            }
        );
    }

    #[test]
    fn test_expand_rejects_duplicates_and_empty() {
        let dup_step = PipelineDefinition::new("p")
            .with_step(StepSpec::new("a").writes("x"))
            .with_step(StepSpec::new("a").writes("y"));
        assert!(matches!(
            RunGraph::expand(run(), &dup_step),
            Err(MalformedPipelineError::DuplicateStep(_))
        ));

        let dup_output = PipelineDefinition::new("p")
            .with_step(StepSpec::new("a").writes("x"))
            .with_step(StepSpec::new("b").writes("x"));
        assert!(matches!(
            RunGraph::expand(run(), &dup_output),
            Err(MalformedPipelineError::DuplicateOutput { .. })
        ));

        assert!(matches!(
            RunGraph::expand(run(), &PipelineDefinition::new("empty")),
            Err(MalformedPipelineError::Empty(_))
        ));
    }

    #[test]
    fn test_chain_runs_in_order_and_completes() {
        let mut graph = started(&chain());
        assert_eq!(ready_ids(&graph), vec!["r1/a"]);

        complete(&mut graph, "r1/a");
        assert_eq!(ready_ids(&graph), vec!["r1/b"]);

        complete(&mut graph, "r1/b");
        let last = complete(&mut graph, "r1/c");
        assert!(last.finished_run());
        assert_eq!(graph.status(), Status::Complete);
        assert!(graph.ready_units().is_empty());
    }

    #[test]
    fn test_independent_steps_ready_together() {
        let def = PipelineDefinition::new("fan")
            .with_step(StepSpec::new("a").reads("raw").writes("x"))
            .with_step(StepSpec::new("b").reads("raw").writes("y"));
        let graph = started(&def);
        assert_eq!(ready_ids(&graph), vec!["r1/a", "r1/b"]);
    }

    #[test]
    fn test_assigned_unit_is_not_ready() {
        let mut graph = started(&chain());
        graph.assign(&UnitId::new("r1/a"), Rank::new(2)).unwrap();
        assert!(graph.ready_units().is_empty());
        let unit = graph.unit(&UnitId::new("r1/a")).unwrap();
        assert_eq!(unit.assigned_to, Some(Rank::new(2)));
        assert_eq!(unit.attempts, 1);
    }

    #[test]
    fn test_assign_rejects_blocked_unit() {
        let mut graph = started(&chain());
        assert!(graph.assign(&UnitId::new("r1/b"), Rank::new(1)).is_err());
    }

    #[test]
    fn test_failure_cancels_siblings_and_fails_run() {
        let mut graph = started(&chain());
        complete(&mut graph, "r1/a");

        let b = UnitId::new("r1/b");
        graph.assign(&b, Rank::new(1)).unwrap();
        let advance = graph
            .advance(
                &b,
                UnitOutcome::Failed {
                    diagnostic: FailureDiagnostic::step_failed("boom"),
                },
            )
            .unwrap();

        assert_eq!(advance.run_status, Some(Status::Failed));
        assert_eq!(advance.cancelled_units, vec![UnitId::new("r1/c")]);
        let signal = advance.signal.unwrap();
        assert_eq!(signal.reason, CancelReason::UnitFailed { unit_id: b });
        assert_eq!(graph.diagnostic().unwrap().message, "boom");
        assert_eq!(
            graph.unit(&UnitId::new("r1/c")).unwrap().status,
            Status::Cancelled
        );
        assert!(graph.ready_units().is_empty());
    }

    #[test]
    fn test_same_outcome_twice_is_ignored() {
        let mut graph = started(&chain());
        let first = complete(&mut graph, "r1/a");
        assert!(first.applied);

        let again = graph
            .advance(&UnitId::new("r1/a"), UnitOutcome::Complete { outputs: vec![] })
            .unwrap();
        assert!(!again.applied);
        assert_eq!(again, Advance::default());
        // The first outputs are kept.
        let unit = graph.unit(&UnitId::new("r1/a")).unwrap();
        assert!(matches!(&unit.outcome, Some(UnitOutcome::Complete { outputs }) if outputs.len() == 1));
    }

    #[test]
    fn test_cancel_marks_running_unit_cancelled() {
        let mut graph = started(&chain());
        complete(&mut graph, "r1/a");
        graph.assign(&UnitId::new("r1/b"), Rank::new(1)).unwrap();

        let advance = graph.cancel(CancelReason::Requested).unwrap();
        assert_eq!(advance.run_status, Some(Status::Cancelled));
        assert_eq!(
            advance.cancelled_units,
            vec![UnitId::new("r1/b"), UnitId::new("r1/c")]
        );

        // A late report from the worker changes nothing.
        let late = graph
            .advance(&UnitId::new("r1/b"), UnitOutcome::Complete { outputs: vec![] })
            .unwrap();
        assert!(!late.applied);
        assert_eq!(graph.status(), Status::Cancelled);

        // Cancelling again is a no-op.
        assert!(!graph.cancel(CancelReason::Requested).unwrap().applied);
    }

    #[test]
    fn test_requeue_makes_unit_ready_again() {
        let mut graph = started(&chain());
        let a = UnitId::new("r1/a");
        graph.assign(&a, Rank::new(1)).unwrap();
        graph.requeue(&a).unwrap();
        assert_eq!(ready_ids(&graph), vec!["r1/a"]);

        graph.assign(&a, Rank::new(2)).unwrap();
        assert_eq!(graph.unit(&a).unwrap().attempts, 2);
    }

    #[test]
    fn test_replay_restores_completed_units() {
        let mut graph = started(&chain());
        let a = UnitId::new("r1/a");
        let advance = graph
            .replay(&a, UnitOutcome::Complete { outputs: vec![] })
            .unwrap();
        assert!(advance.applied);
        assert_eq!(graph.unit(&a).unwrap().status, Status::Complete);
        assert_eq!(ready_ids(&graph), vec!["r1/b"]);

        // Cancelled outcomes and repeats are not replayed.
        assert!(!graph.replay(&a, UnitOutcome::Complete { outputs: vec![] }).unwrap().applied);
        let b = UnitId::new("r1/b");
        assert!(!graph.replay(&b, UnitOutcome::Cancelled).unwrap().applied);
        assert_eq!(ready_ids(&graph), vec!["r1/b"]);
    }

    #[test]
    fn test_replayed_failure_fails_run() {
        let mut graph = started(&chain());
        let advance = graph
            .replay(
                &UnitId::new("r1/a"),
                UnitOutcome::Failed {
                    diagnostic: FailureDiagnostic::step_failed("boom"),
                },
            )
            .unwrap();
        assert_eq!(advance.run_status, Some(Status::Failed));
        assert_eq!(advance.cancelled_units, vec![UnitId::new("r1/b"), UnitId::new("r1/c")]);
    }

    #[test]
    fn test_fail_run_without_unit() {
        let mut graph = started(&chain());
        let advance = graph
            .fail(
                FailureDiagnostic::new(FailureDiagnostic::NO_LIVE_WORKERS, "none left"),
                CancelReason::NoLiveWorkers,
            )
            .unwrap();
        assert_eq!(advance.run_status, Some(Status::Failed));
        assert_eq!(advance.cancelled_units.len(), 3);
    }

    #[test]
    fn test_unknown_unit() {
        let mut graph = started(&chain());
        let err = graph
            .advance(&UnitId::new("r1/zzz"), UnitOutcome::Cancelled)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnitNotFound(_)));
    }
}
