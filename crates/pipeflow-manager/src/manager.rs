//! The Manager: one serialized decision loop over runs and worker slots.
//!
//! Each [`Manager::tick`]:
//! 1. polls the registry for new runs and stop requests (at most once per
//!    poll interval); the first poll also resumes the runs a previous
//!    Manager left Running,
//! 2. hands ready units to idle workers,
//! 3. drains worker messages and advances the run graphs,
//! 4. declares silent workers dead and requeues their units,
//! 5. (re)delivers pending cancellations,
//! 6. persists terminal run statuses and retires finished runs.
//!
//! Only this loop mutates run, unit and slot state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipeflow_core::{
    Advance, CancelReason, FailureDiagnostic, Rank, Run, RunGraph, RunId, SlotStatus, Status, UnitId,
    UnitOutcome,
};
use pipeflow_proto::{pb, Envelope, Payload};
use pipeflow_transport::Transport;

use crate::cancellation::CancellationTracker;
use crate::metrics::collect_metrics;
use crate::registry::{DefinitionStore, RunRegistry};
use crate::runs::RunTable;
use crate::scheduler::{self, Dispatch};
use crate::slots::{Assignment, SlotTable};
use crate::{ManagerConfig, ManagerError, RegistryError};

/// Upper bound on worker messages handled in one iteration.
const MAX_MESSAGES_PER_TICK: usize = 1024;

/// Run a registry call, giving up after `limit`.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, RegistryError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RegistryError::Timeout))
}

pub struct Manager {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn RunRegistry>,
    definitions: Arc<dyn DefinitionStore>,
    runs: RunTable,
    slots: SlotTable,
    cancellations: CancellationTracker,
    last_poll: Option<Instant>,
    /// Set once the runs of a previous Manager were picked up.
    recovered: bool,
}

impl Manager {
    /// Create a Manager on the rank-0 endpoint of a cluster.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn RunRegistry>,
        definitions: Arc<dyn DefinitionStore>,
    ) -> Result<Self, ManagerError> {
        if !transport.rank().is_manager() {
            return Err(ManagerError::Config(format!(
                "manager must run on rank 0, got rank {}",
                transport.rank()
            )));
        }
        if transport.size() < 2 {
            return Err(ManagerError::Config("cluster has no worker rank".to_string()));
        }

        let slots = SlotTable::new(transport.size(), Instant::now());
        Ok(Self {
            config,
            transport,
            registry,
            definitions,
            runs: RunTable::new(),
            slots,
            cancellations: CancellationTracker::new(),
            last_poll: None,
            recovered: false,
        })
    }

    pub fn runs(&self) -> &RunTable {
        &self.runs
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn cancellations(&self) -> &CancellationTracker {
        &self.cancellations
    }

    /// Graph of a run that has not been retired yet.
    pub fn run_graph(&self, run_id: &RunId) -> Option<&RunGraph> {
        self.runs.get(run_id).map(|r| &r.graph)
    }

    /// Drive the loop until `shutdown` fires, then tell every worker to stop
    /// and collect the reports of the units they were still running.
    ///
    /// Returns an error only when the Manager's own transport endpoint fails.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ManagerError> {
        info!(
            workers = self.transport.size() - 1,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Manager started"
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Manager transport failed");
                return Err(e);
            }
        }

        self.shutdown_workers().await;
        self.collect_final_reports().await
    }

    /// One iteration of the decision loop.
    pub async fn tick(&mut self) -> Result<(), ManagerError> {
        let now = Instant::now();
        let poll_due = self
            .last_poll
            .map_or(true, |at| now.duration_since(at) >= self.config.poll_interval);
        if poll_due {
            self.last_poll = Some(now);
            if !self.recovered {
                self.recovered = self.recover_runs().await;
            }
            self.absorb_new_runs().await;
            self.absorb_cancellations().await;
            self.write_metrics().await;
        }

        self.dispatch_ready().await;
        self.collect_messages().await?;
        self.check_liveness().await;
        self.propagate_cancellations().await;
        self.finish_runs().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Pending runs from the registry that this Manager has not absorbed yet.
    pub async fn poll_new_runs(&self) -> Result<Vec<Run>, RegistryError> {
        let runs = bounded(self.config.registry_timeout, self.registry.list_pending_runs()).await?;
        Ok(runs.into_iter().filter(|r| !self.runs.knows(&r.id)).collect())
    }

    /// Active runs an operator asked to stop.
    pub async fn poll_cancellations(&self) -> Result<Vec<RunId>, RegistryError> {
        let ids = bounded(self.config.registry_timeout, self.registry.list_cancel_requests()).await?;
        Ok(ids
            .into_iter()
            .filter(|id| self.runs.get(id).is_some_and(|r| !r.graph.is_terminal()))
            .collect())
    }

    async fn absorb_new_runs(&mut self) {
        match self.poll_new_runs().await {
            Ok(runs) => {
                for run in runs {
                    self.accept(run).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to poll run registry"),
        }
    }

    async fn absorb_cancellations(&mut self) {
        match self.poll_cancellations().await {
            Ok(ids) => {
                for run_id in ids {
                    info!(run_id = %run_id, "Stop requested");
                    self.cancel_run(&run_id, CancelReason::Requested).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to poll cancel requests"),
        }
    }

    /// Expand a new run and start driving it.
    ///
    /// Anything short of a persisted Running (or Failed) status leaves the
    /// run unknown, so the next poll tries again.
    async fn accept(&mut self, run: Run) {
        let run_id = run.id.clone();
        let definition = match bounded(
            self.config.registry_timeout,
            self.definitions.get_definition(&run.pipeline_id),
        )
        .await
        {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                let diagnostic = FailureDiagnostic::new(
                    FailureDiagnostic::UNKNOWN_PIPELINE,
                    format!("pipeline {} not found", run.pipeline_id),
                );
                self.reject(run_id, diagnostic).await;
                return;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to load pipeline definition");
                return;
            }
        };

        let mut graph = match RunGraph::expand(run, &definition) {
            Ok(graph) => graph,
            Err(e) => {
                self.reject(run_id, FailureDiagnostic::from(&e)).await;
                return;
            }
        };
        if let Err(e) = graph.start() {
            error!(run_id = %run_id, error = %e, "Run cannot be started");
            self.runs.remember(run_id);
            return;
        }
        if !self.record_status(&run_id, Status::Running, None).await {
            return;
        }

        info!(
            run_id = %run_id,
            pipeline_id = %definition.id,
            units = graph.units().len(),
            "Run accepted"
        );
        let cancel_requested = graph.run().cancel_requested;
        self.runs.insert(graph);

        if cancel_requested {
            info!(run_id = %run_id, "Run was cancelled before pickup");
            self.cancel_run(&run_id, CancelReason::Requested).await;
        }
    }

    /// Fail a run that cannot be expanded. Nothing is dispatched for it.
    ///
    /// Returns whether the failure reached the registry.
    async fn reject(&mut self, run_id: RunId, diagnostic: FailureDiagnostic) -> bool {
        error!(
            run_id = %run_id,
            kind = %diagnostic.kind,
            message = %diagnostic.message,
            "Run rejected"
        );
        let recorded = self.record_status(&run_id, Status::Failed, Some(&diagnostic)).await;
        if recorded {
            self.runs.remember(run_id);
        }
        recorded
    }

    /// Pick up the runs a previous Manager left Running.
    ///
    /// Returns false when some run could not be rebuilt yet, so the next
    /// poll tries again. Runs already resumed are skipped then.
    async fn recover_runs(&mut self) -> bool {
        let runs = match bounded(self.config.registry_timeout, self.registry.list_active_runs()).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "Failed to list active runs");
                return false;
            }
        };
        let mut done = true;
        for run in runs {
            if !self.runs.knows(&run.id) {
                done &= self.resume(run).await;
            }
        }
        done
    }

    /// Rebuild the graph of a Running run and replay its recorded outcomes.
    /// Units that were in flight when the previous Manager stopped are
    /// Pending again.
    async fn resume(&mut self, run: Run) -> bool {
        let run_id = run.id.clone();
        let outcomes = match bounded(
            self.config.registry_timeout,
            self.registry.list_unit_outcomes(&run_id),
        )
        .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to load recorded outcomes");
                return false;
            }
        };
        let definition = match bounded(
            self.config.registry_timeout,
            self.definitions.get_definition(&run.pipeline_id),
        )
        .await
        {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                let diagnostic = FailureDiagnostic::new(
                    FailureDiagnostic::UNKNOWN_PIPELINE,
                    format!("pipeline {} not found", run.pipeline_id),
                );
                return self.reject(run_id, diagnostic).await;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to load pipeline definition");
                return false;
            }
        };

        let mut graph = match RunGraph::expand(run, &definition) {
            Ok(graph) => graph,
            Err(e) => return self.reject(run_id, FailureDiagnostic::from(&e)).await,
        };
        if graph.status() == Status::Pending {
            if let Err(e) = graph.start() {
                error!(run_id = %run_id, error = %e, "Run cannot be resumed");
                self.runs.remember(run_id);
                return true;
            }
        }

        let mut advances = Vec::new();
        for (unit_id, outcome) in outcomes {
            match graph.replay(&unit_id, outcome) {
                Ok(advance) if advance.applied => advances.push(advance),
                Ok(_) => {}
                Err(e) => warn!(
                    run_id = %run_id,
                    unit_id = %unit_id,
                    error = %e,
                    "Recorded outcome does not match the pipeline, ignoring it"
                ),
            }
        }

        info!(
            run_id = %run_id,
            units = graph.units().len(),
            restored = advances.len(),
            "Run resumed"
        );
        let cancel_requested = graph.run().cancel_requested;
        self.runs.insert(graph);
        for advance in advances {
            self.apply_advance(&run_id, advance).await;
        }
        if cancel_requested {
            self.cancel_run(&run_id, CancelReason::Requested).await;
        }
        true
    }

    async fn record_status(&self, run_id: &RunId, status: Status, diagnostic: Option<&FailureDiagnostic>) -> bool {
        let call = self.registry.record_status(run_id, status, diagnostic);
        match bounded(self.config.registry_timeout, call).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %run_id, status = %status, error = %e, "Failed to record run status, will retry");
                false
            }
        }
    }

    async fn record_outcome(&self, run_id: &RunId, unit_id: &UnitId, outcome: &UnitOutcome) {
        let call = self.registry.record_unit_outcome(run_id, unit_id, outcome);
        if let Err(e) = bounded(self.config.registry_timeout, call).await {
            warn!(run_id = %run_id, unit_id = %unit_id, error = %e, "Failed to record unit outcome");
        }
    }

    async fn write_metrics(&self) {
        let Some(path) = &self.config.metrics_path else {
            return;
        };
        let text = collect_metrics(&self.runs, &self.slots, &self.cancellations);
        if let Err(e) = tokio::fs::write(path, text).await {
            warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    // ------------------------------------------------------------------
    // Run graph effects
    // ------------------------------------------------------------------

    async fn cancel_run(&mut self, run_id: &RunId, reason: CancelReason) {
        let Some(active) = self.runs.get_mut(run_id) else {
            return;
        };
        match active.graph.cancel(reason) {
            Ok(advance) => self.apply_advance(run_id, advance).await,
            Err(e) => error!(run_id = %run_id, error = %e, "Failed to cancel run"),
        }
    }

    /// Record what an advance did to the siblings and the run.
    async fn apply_advance(&mut self, run_id: &RunId, advance: Advance) {
        for unit_id in &advance.cancelled_units {
            self.record_outcome(run_id, unit_id, &UnitOutcome::Cancelled).await;
        }
        if let Some(signal) = advance.signal {
            self.cancellations.raise(signal);
        }
        if let Some(status) = advance.run_status.filter(|s| s.is_terminal()) {
            info!(
                run_id = %run_id,
                status = %status,
                cancelled_units = advance.cancelled_units.len(),
                "Run finished"
            );
        }
    }

    /// Put a lost unit back in the queue, unless its run already ended.
    fn requeue(&mut self, assignment: Assignment) {
        let Some(active) = self.runs.get_mut(&assignment.run_id) else {
            return;
        };
        if active.graph.is_terminal() {
            return;
        }
        match active.graph.requeue(&assignment.unit_id) {
            Ok(()) => warn!(
                run_id = %assignment.run_id,
                unit_id = %assignment.unit_id,
                "Unit requeued"
            ),
            Err(e) => error!(unit_id = %assignment.unit_id, error = %e, "Failed to requeue unit"),
        }
    }

    fn lose_worker(&mut self, rank: Rank) {
        if let Some(assignment) = self.slots.mark_dead(rank) {
            self.requeue(assignment);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch_ready(&mut self) {
        let idle = self.slots.idle();
        if idle.is_empty() {
            return;
        }
        for dispatch in scheduler::plan(&self.runs, &idle) {
            self.dispatch(dispatch).await;
        }
    }

    async fn dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch { run_id, unit_id, rank } = dispatch;
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        if let Err(e) = active.graph.assign(&unit_id, rank) {
            error!(unit_id = %unit_id, error = %e, "Failed to assign unit");
            return;
        }
        let Some(unit) = active.graph.unit(&unit_id) else {
            return;
        };
        let attempt = unit.attempts;
        let message = pb::UnitAssignment::new(&run_id, &unit_id, unit.step.clone(), attempt);

        self.slots.assign(
            rank,
            Assignment {
                run_id: run_id.clone(),
                unit_id: unit_id.clone(),
            },
        );

        match self.transport.send(rank, Payload::Assign(message)).await {
            Ok(()) => info!(
                run_id = %run_id,
                unit_id = %unit_id,
                rank = %rank,
                attempt,
                "Unit assigned"
            ),
            Err(e) => {
                warn!(rank = %rank, error = %e, "Failed to send assignment, presuming worker dead");
                self.lose_worker(rank);
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker messages
    // ------------------------------------------------------------------

    async fn collect_messages(&mut self) -> Result<(), ManagerError> {
        let mut next = self.transport.recv_timeout(self.config.recv_timeout).await?;
        let mut handled = 0;
        while let Some(envelope) = next {
            self.handle_envelope(envelope).await;
            handled += 1;
            if handled >= MAX_MESSAGES_PER_TICK {
                break;
            }
            next = self.transport.try_recv()?;
        }
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let rank = envelope.source_rank();
        let kind = envelope.kind();
        if self.slots.get(rank).is_none() {
            warn!(rank = %rank, kind, "Message from a rank outside the cluster");
            return;
        }

        match envelope.payload {
            Some(Payload::Hello(hello)) => {
                let forgotten = self.slots.hello(rank, hello.hostname.clone(), Instant::now());
                info!(
                    rank = %rank,
                    hostname = %hello.hostname,
                    version = %hello.version,
                    "Worker joined"
                );
                if let Some(assignment) = forgotten {
                    warn!(rank = %rank, unit_id = %assignment.unit_id, "Worker restarted while holding a unit");
                    self.requeue(assignment);
                }
            }
            Some(Payload::Heartbeat(_)) => {
                if !self.slots.heartbeat(rank, Instant::now()) {
                    debug!(rank = %rank, "Heartbeat from a dead worker ignored");
                }
            }
            Some(Payload::Report(report)) => self.handle_report(rank, report).await,
            _ => warn!(rank = %rank, kind, "Unexpected message from worker"),
        }
    }

    async fn handle_report(&mut self, rank: Rank, report: pb::UnitReport) {
        let run_id = RunId::new(report.run_id.clone());
        let unit_id = UnitId::new(report.unit_id.clone());

        // Reports from dead slots and duplicates land here.
        if !self.slots.holds(rank, &run_id, &unit_id) {
            warn!(
                rank = %rank,
                run_id = %run_id,
                unit_id = %unit_id,
                "Report for a unit the worker does not hold, ignoring"
            );
            return;
        }
        self.slots.release(rank);

        let outcome = report.outcome().unwrap_or_else(|e| {
            warn!(rank = %rank, unit_id = %unit_id, error = %e, "Unreadable report, failing the unit");
            UnitOutcome::Failed {
                diagnostic: FailureDiagnostic::step_failed(format!("unreadable report: {e}")),
            }
        });

        let Some(active) = self.runs.get_mut(&run_id) else {
            warn!(run_id = %run_id, unit_id = %unit_id, "Report for an unknown run");
            return;
        };

        // The worker stopped the unit on its own (shutdown); the run still
        // needs it.
        if outcome == UnitOutcome::Cancelled && !active.graph.is_terminal() {
            info!(run_id = %run_id, unit_id = %unit_id, rank = %rank, "Unit interrupted on its worker");
            self.requeue(Assignment { run_id, unit_id });
            return;
        }

        match active.graph.advance(&unit_id, outcome.clone()) {
            Ok(advance) if advance.applied => {
                info!(
                    run_id = %run_id,
                    unit_id = %unit_id,
                    rank = %rank,
                    status = %outcome.status(),
                    "Unit finished"
                );
                self.record_outcome(&run_id, &unit_id, &outcome).await;
                self.apply_advance(&run_id, advance).await;
            }
            Ok(_) => debug!(run_id = %run_id, unit_id = %unit_id, "Report for a terminal unit ignored"),
            Err(e) => error!(run_id = %run_id, unit_id = %unit_id, error = %e, "Failed to apply report"),
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    fn expire_silent_workers(&mut self) {
        let expired = self.slots.expire(Instant::now(), self.config.heartbeat_timeout);
        for (rank, lost) in expired {
            warn!(
                rank = %rank,
                timeout_secs = self.config.heartbeat_timeout.as_secs(),
                "Worker missed heartbeats, presumed dead"
            );
            if let Some(assignment) = lost {
                self.requeue(assignment);
            }
        }
    }

    async fn check_liveness(&mut self) {
        self.expire_silent_workers();
        if self.slots.has_prospects() {
            return;
        }
        let stranded: Vec<RunId> = self
            .runs
            .iter()
            .filter(|r| !r.graph.is_terminal())
            .map(|r| r.run_id().clone())
            .collect();
        for run_id in stranded {
            error!(run_id = %run_id, "No live worker left, failing run");
            let diagnostic =
                FailureDiagnostic::new(FailureDiagnostic::NO_LIVE_WORKERS, "every worker slot is dead");
            let Some(active) = self.runs.get_mut(&run_id) else {
                continue;
            };
            match active.graph.fail(diagnostic, CancelReason::NoLiveWorkers) {
                Ok(advance) => self.apply_advance(&run_id, advance).await,
                Err(e) => error!(run_id = %run_id, error = %e, "Failed to fail run"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation delivery
    // ------------------------------------------------------------------

    async fn propagate_cancellations(&mut self) {
        for run_id in self.cancellations.run_ids() {
            if self.slots.holders_of(&run_id).is_empty() {
                if let Some(deliveries) = self.cancellations.settle(&run_id) {
                    debug!(run_id = %run_id, deliveries, "Cancellation acknowledged by every holder");
                }
            }
        }

        let now = Instant::now();
        for signal in self.cancellations.due(now, self.config.cancel_resend_interval) {
            let message = pb::CancelRun {
                run_id: signal.run_id.to_string(),
                reason: signal.reason.to_string(),
            };
            for rank in self.slots.holders_of(&signal.run_id) {
                debug!(run_id = %signal.run_id, rank = %rank, "Delivering cancellation");
                if let Err(e) = self.transport.send(rank, Payload::Cancel(message.clone())).await {
                    warn!(rank = %rank, error = %e, "Failed to deliver cancellation, presuming worker dead");
                    self.lose_worker(rank);
                }
            }
            self.cancellations.record_delivery(&signal.run_id, now);
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Persist terminal statuses, then retire runs nobody works on anymore.
    async fn finish_runs(&mut self) {
        let unpersisted: Vec<(RunId, Status, Option<FailureDiagnostic>)> = self
            .runs
            .iter()
            .filter(|r| r.graph.is_terminal() && !r.status_persisted)
            .map(|r| (r.run_id().clone(), r.graph.status(), r.graph.diagnostic().cloned()))
            .collect();
        for (run_id, status, diagnostic) in unpersisted {
            if self.record_status(&run_id, status, diagnostic.as_ref()).await {
                if let Some(active) = self.runs.get_mut(&run_id) {
                    active.status_persisted = true;
                }
            }
        }

        let retirable: Vec<RunId> = self
            .runs
            .iter()
            .filter(|r| {
                r.status_persisted
                    && !self.cancellations.is_pending(r.run_id())
                    && self.slots.holders_of(r.run_id()).is_empty()
            })
            .map(|r| r.run_id().clone())
            .collect();
        for run_id in retirable {
            self.runs.retire(&run_id);
            debug!(run_id = %run_id, "Run retired");
        }
    }

    async fn shutdown_workers(&self) {
        let grace_ms = self.config.shutdown_grace.as_millis() as u64;
        info!(grace_ms, "Shutting down workers");
        let payload = Payload::Shutdown(pb::Shutdown { grace_ms });
        if let Err(e) = self.transport.broadcast(payload).await {
            warn!(error = %e, "Shutdown did not reach every worker");
        }
    }

    /// Wait for the workers that were busy at shutdown to report, for at most
    /// the grace period plus the margin. Nothing new is dispatched; runs left
    /// unfinished stay Running in the registry and are resumed by the next
    /// Manager.
    async fn collect_final_reports(&mut self) -> Result<(), ManagerError> {
        let deadline = Instant::now() + self.config.shutdown_grace + self.config.shutdown_margin;
        while self.slots.count(SlotStatus::Busy) > 0 && Instant::now() < deadline {
            self.collect_messages().await?;
            self.expire_silent_workers();
            self.propagate_cancellations().await;
            self.finish_runs().await;
        }

        let busy = self.slots.count(SlotStatus::Busy);
        if busy > 0 {
            warn!(busy, "Stopping while workers still hold units");
        }
        self.finish_runs().await;
        Ok(())
    }
}
