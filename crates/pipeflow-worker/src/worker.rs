//! The worker's main procedure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pipeflow_core::{FailureDiagnostic, Rank, RunId, UnitId, UnitOutcome};
use pipeflow_proto::{pb, Payload};
use pipeflow_transport::Transport;

use crate::engine::{StepEngine, StepInvocation};
use crate::executor::execute_unit;
use crate::{WorkerConfig, WorkerError};

/// One worker rank: executes units handed out by the manager, one at a time.
pub struct Worker {
    config: WorkerConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn StepEngine>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn StepEngine>,
    ) -> Result<Self, WorkerError> {
        if transport.rank().is_manager() {
            return Err(WorkerError::Config("rank 0 is reserved for the manager".to_string()));
        }
        Ok(Self {
            config,
            transport,
            engine,
        })
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    /// Say hello, then serve assignments until the manager says shutdown.
    ///
    /// Returns an error when the connection to the manager is lost.
    pub async fn main_procedure(&self) -> Result<(), WorkerError> {
        self.send_hello().await?;
        info!(rank = %self.rank(), "Worker ready");

        let (current_tx, current_rx) = watch::channel(None);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            self.config.heartbeat_interval,
            current_rx,
        ));

        let result = self.serve(&current_tx).await;
        heartbeat.abort();
        result
    }

    async fn send_hello(&self) -> Result<(), WorkerError> {
        let hello = pb::WorkerHello {
            rank: self.rank().get(),
            hostname: self.config.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.transport.send(Rank::MANAGER, Payload::Hello(hello)).await?;
        Ok(())
    }

    async fn serve(&self, current: &watch::Sender<Option<UnitId>>) -> Result<(), WorkerError> {
        loop {
            let envelope = self.transport.recv().await?;
            let kind = envelope.kind();
            match envelope.payload {
                Some(Payload::Assign(assignment)) => {
                    if self.run_assignment(assignment, current).await? {
                        info!(rank = %self.rank(), "Shutting down after the current unit");
                        return Ok(());
                    }
                }
                Some(Payload::Cancel(cancel)) => {
                    debug!(run_id = %cancel.run_id, "Cancellation while idle ignored");
                }
                Some(Payload::Shutdown(_)) => {
                    info!(rank = %self.rank(), "Shutdown received while idle");
                    return Ok(());
                }
                _ => warn!(kind, "Unexpected message"),
            }
        }
    }

    /// Execute one assignment and report it. Returns whether a shutdown
    /// arrived meanwhile.
    async fn run_assignment(
        &self,
        assignment: pb::UnitAssignment,
        current: &watch::Sender<Option<UnitId>>,
    ) -> Result<bool, WorkerError> {
        let run_id = RunId::new(assignment.run_id.clone());
        let unit_id = UnitId::new(assignment.unit_id.clone());

        let step = match assignment.step_spec() {
            Ok(step) => step,
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "Invalid assignment");
                let diagnostic = FailureDiagnostic::step_failed(format!("invalid assignment: {e}"));
                self.report(&run_id, &unit_id, UnitOutcome::Failed { diagnostic }).await?;
                return Ok(false);
            }
        };

        info!(
            run_id = %run_id,
            unit_id = %unit_id,
            step_id = %step.id,
            attempt = assignment.attempt,
            "Executing unit"
        );

        let invocation = StepInvocation {
            run_id,
            unit_id,
            step,
            attempt: assignment.attempt,
        };
        current.send_replace(Some(invocation.unit_id.clone()));
        let execution = execute_unit(
            self.transport.as_ref(),
            self.engine.as_ref(),
            &self.config,
            &invocation,
        )
        .await;
        current.send_replace(None);
        let execution = execution?;

        info!(
            run_id = %invocation.run_id,
            unit_id = %invocation.unit_id,
            status = %execution.outcome.status(),
            "Unit finished"
        );
        self.report(&invocation.run_id, &invocation.unit_id, execution.outcome)
            .await?;
        Ok(execution.shutdown)
    }

    async fn report(&self, run_id: &RunId, unit_id: &UnitId, outcome: UnitOutcome) -> Result<(), WorkerError> {
        let report = pb::UnitReport::new(run_id, unit_id, outcome);
        self.transport.send(Rank::MANAGER, Payload::Report(report)).await?;
        Ok(())
    }
}

async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    interval: Duration,
    current: watch::Receiver<Option<UnitId>>,
) {
    let mut timer = tokio::time::interval(interval);
    loop {
        timer.tick().await;

        let unit = current.borrow().clone();
        let heartbeat = pb::Heartbeat {
            rank: transport.rank().get(),
            busy: unit.is_some(),
            unit_id: unit.map(UnitId::into_inner).unwrap_or_default(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        if let Err(e) = transport.send(Rank::MANAGER, Payload::Heartbeat(heartbeat)).await {
            warn!(error = %e, "Failed to send heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{Interrupt, StepResult};
    use pipeflow_core::{DatasetHandle, StepSpec};
    use pipeflow_proto::Envelope;
    use pipeflow_transport::{LocalCluster, LocalTransport};

    #[derive(Clone, Copy)]
    enum Script {
        /// Complete after the delay.
        Finish(Duration),
        /// Run until interrupted, checking at safe points.
        UntilInterrupted,
        /// Ignore interruption and complete after the delay.
        Stubborn(Duration),
    }

    #[derive(Default)]
    struct ScriptedEngine {
        scripts: HashMap<String, Script>,
        started: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn with(mut self, step: &str, script: Script) -> Self {
            self.scripts.insert(step.to_string(), script);
            self
        }
    }

    #[async_trait]
    impl StepEngine for ScriptedEngine {
        async fn execute(&self, invocation: &StepInvocation, interrupt: &Interrupt) -> StepResult {
            self.started.lock().unwrap().push(invocation.step.id.to_string());
            let outputs = invocation
                .outputs()
                .iter()
                .map(|d| DatasetHandle::new(d.clone(), format!("mem://{d}")))
                .collect();
            match self.scripts.get(invocation.step.id.as_str()) {
                Some(Script::Finish(delay)) | Some(Script::Stubborn(delay)) => {
                    tokio::time::sleep(*delay).await;
                    StepResult::Completed(outputs)
                }
                Some(Script::UntilInterrupted) => loop {
                    if let Err(stop) = interrupt.checkpoint() {
                        return stop.into();
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                },
                None => StepResult::Failed(FailureDiagnostic::step_failed("no script")),
            }
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval: Duration::from_secs(1),
            cancel_poll_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
            interrupt_timeout: Duration::from_secs(1),
            hostname: "test".to_string(),
        }
    }

    /// A worker on rank 1 and the manager endpoint driving it.
    fn setup(engine: ScriptedEngine) -> (LocalTransport, Worker, Arc<ScriptedEngine>) {
        let mut cluster = LocalCluster::new(2);
        let manager = cluster.endpoint(Rank::MANAGER).unwrap();
        let transport = Arc::new(cluster.endpoint(Rank::new(1)).unwrap());
        let engine = Arc::new(engine);
        let worker = Worker::new(config(), transport, engine.clone()).unwrap();
        (manager, worker, engine)
    }

    async fn assign(manager: &LocalTransport, run: &str, step: &str) {
        let run_id = RunId::new(run);
        let step = StepSpec::new(step).writes("out");
        let unit_id = UnitId::for_step(&run_id, &step.id);
        let assignment = pb::UnitAssignment::new(&run_id, &unit_id, step, 1);
        manager.send(Rank::new(1), Payload::Assign(assignment)).await.unwrap();
    }

    async fn cancel(manager: &LocalTransport, run: &str) {
        let cancel = pb::CancelRun {
            run_id: run.to_string(),
            reason: "stop requested".to_string(),
        };
        manager.send(Rank::new(1), Payload::Cancel(cancel)).await.unwrap();
    }

    async fn shutdown(manager: &LocalTransport, grace_ms: u64) {
        manager
            .send(Rank::new(1), Payload::Shutdown(pb::Shutdown { grace_ms }))
            .await
            .unwrap();
    }

    /// Next report, skipping hellos and heartbeats.
    async fn next_report(manager: &LocalTransport) -> pb::UnitReport {
        loop {
            let Envelope { payload, .. } = manager.recv().await.unwrap();
            if let Some(Payload::Report(report)) = payload {
                return report;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_executes_and_reports() {
        let (manager, worker, engine) = setup(ScriptedEngine::default().with("a", Script::Finish(Duration::from_secs(3))));
        let handle = tokio::spawn(async move { worker.main_procedure().await });

        let hello = manager.recv().await.unwrap();
        assert_eq!(hello.kind(), "hello");

        assign(&manager, "r1", "a").await;
        let report = next_report(&manager).await;
        assert_eq!(report.unit_id, "r1/a");
        assert_eq!(
            report.outcome().unwrap(),
            UnitOutcome::Complete {
                outputs: vec![DatasetHandle::new("out", "mem://out")]
            }
        );
        assert_eq!(*engine.started.lock().unwrap(), vec!["a".to_string()]);

        shutdown(&manager, 0).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_while_busy() {
        let (manager, worker, _engine) = setup(ScriptedEngine::default().with("a", Script::Finish(Duration::from_secs(5))));
        let _handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        loop {
            let envelope = manager.recv().await.unwrap();
            if let Some(Payload::Heartbeat(heartbeat)) = envelope.payload {
                if heartbeat.busy {
                    assert_eq!(heartbeat.unit_id, "r1/a");
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_unit() {
        let (manager, worker, _engine) = setup(ScriptedEngine::default().with("a", Script::UntilInterrupted));
        let handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel(&manager, "r1").await;
        cancel(&manager, "r1").await;

        let report = next_report(&manager).await;
        assert_eq!(report.outcome().unwrap(), UnitOutcome::Cancelled);

        // A late duplicate while idle is a no-op.
        cancel(&manager, "r1").await;
        shutdown(&manager, 0).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_of_another_run_is_ignored() {
        let (manager, worker, _engine) = setup(ScriptedEngine::default().with("a", Script::Finish(Duration::from_secs(1))));
        let _handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        cancel(&manager, "r2").await;

        let report = next_report(&manager).await;
        assert!(matches!(report.outcome().unwrap(), UnitOutcome::Complete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_cooperative_unit_is_reported_cancelled() {
        let (manager, worker, engine) = setup(ScriptedEngine::default().with("a", Script::Stubborn(Duration::from_secs(2))));
        let _handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel(&manager, "r1").await;

        let report = next_report(&manager).await;
        assert_eq!(report.outcome().unwrap(), UnitOutcome::Cancelled);
        assert_eq!(engine.started.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_busy_finishes_unit() {
        let (manager, worker, _engine) = setup(ScriptedEngine::default().with("a", Script::Finish(Duration::from_secs(2))));
        let handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown(&manager, 10_000).await;

        let report = next_report(&manager).await;
        assert!(matches!(report.outcome().unwrap(), UnitOutcome::Complete { .. }));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_interrupts_unit() {
        let (manager, worker, _engine) = setup(ScriptedEngine::default().with("a", Script::UntilInterrupted));
        let handle = tokio::spawn(async move { worker.main_procedure().await });
        manager.recv().await.unwrap();

        assign(&manager, "r1", "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown(&manager, 500).await;

        let report = next_report(&manager).await;
        assert_eq!(report.outcome().unwrap(), UnitOutcome::Cancelled);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_manager_is_an_error() {
        let mut cluster = LocalCluster::new(2);
        drop(cluster.endpoint(Rank::MANAGER));
        let transport = Arc::new(cluster.endpoint(Rank::new(1)).unwrap());
        let worker = Worker::new(config(), transport, Arc::new(ScriptedEngine::default())).unwrap();

        let err = worker.main_procedure().await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }

    #[test]
    fn test_worker_cannot_take_rank_zero() {
        let mut cluster = LocalCluster::new(2);
        let transport = Arc::new(cluster.endpoint(Rank::MANAGER).unwrap());
        assert!(Worker::new(config(), transport, Arc::new(ScriptedEngine::default())).is_err());
    }
}
