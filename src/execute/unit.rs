//! Driving one analysis unit to completion across as many minions as it takes.

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::harness::TestCatalog;
use super::process::{MinionProcess, MinionRole, WorkerLauncher, classify_exit};
use super::protocol::{ExitCode, MinionMessage, MutantAssignment, ParentMessage, UnitAssignment};
use super::{ExecutionError, ExecutionEvent, ExecutionSettings, UnitState};
use crate::build::AnalysisUnit;
use crate::mutation::{DetectionStatus, MutationDetails, StatusMap, StatusTestPair};

/// How one minion's lifetime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Finished(ExitCode),
    TimedOut,
    Crashed(DetectionStatus),
    Cancelled,
}

impl Attempt {
    fn unfinished_status(self) -> DetectionStatus {
        match self {
            Self::Finished(exit) => exit.status().unwrap_or(DetectionStatus::RunError),
            Self::TimedOut => DetectionStatus::TimedOut,
            Self::Crashed(status) => status,
            Self::Cancelled => DetectionStatus::RunError,
        }
    }

    fn unit_state(self) -> UnitState {
        match self {
            Self::Finished(ExitCode::Ok) => UnitState::Completed,
            Self::Finished(_) | Self::Crashed(_) => UnitState::Crashed,
            Self::TimedOut => UnitState::TimedOut,
            Self::Cancelled => UnitState::Cancelled,
        }
    }
}

enum Next {
    Message(Result<Option<MinionMessage>, super::ProtocolError>),
    Deadline,
    Shutdown,
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) struct UnitRunner<'a> {
    pub(crate) launcher: &'a dyn WorkerLauncher,
    pub(crate) settings: &'a ExecutionSettings,
    pub(crate) catalog: &'a TestCatalog,
    pub(crate) events: &'a mpsc::Sender<ExecutionEvent>,
}

impl UnitRunner<'_> {
    /// Analyse every mutant of `unit`, publishing each verdict once.
    pub(crate) async fn run(
        &self,
        unit: &AnalysisUnit,
        shutdown: &mut watch::Receiver<bool>,
    ) -> UnitState {
        let mut map = StatusMap::new(unit.mutants.iter().cloned());
        for id in map.mark_uncovered() {
            self.publish(&map, &id).await;
        }

        let mut state = UnitState::Completed;
        let mut timeout = unit.timeout;
        while map.has_unrun() {
            let remaining = map.unrun();
            if *shutdown.borrow() {
                self.resolve_all(&mut map, &remaining, DetectionStatus::RunError)
                    .await;
                return UnitState::Cancelled;
            }

            let attempt = self
                .attempt(unit.id, &remaining, timeout, &mut map, shutdown, true)
                .await;
            if attempt.unit_state() != UnitState::Completed {
                state = attempt.unit_state();
            }

            let unfinished = map.unfinished();
            if !unfinished.is_empty() {
                debug!(unit = unit.id, ?attempt, count = unfinished.len(), "correcting unfinished mutants");
            }
            let isolate = self.settings.full_matrix
                && !matches!(attempt, Attempt::Cancelled | Attempt::Finished(ExitCode::Ok));
            for details in unfinished {
                let pair = if isolate {
                    self.isolate(unit.id, &details, shutdown).await
                } else {
                    StatusTestPair::not_analysed(1, attempt.unfinished_status())
                };
                if map.resolve(&details.id, pair) {
                    self.publish(&map, &details.id).await;
                }
            }

            if attempt == Attempt::Cancelled {
                let rest = map.unrun();
                self.resolve_all(&mut map, &rest, DetectionStatus::RunError).await;
                return UnitState::Cancelled;
            }

            let rest = map.unrun();
            if rest.len() == remaining.len() {
                warn!(unit = unit.id, "minion made no progress, abandoning remaining mutants");
                self.resolve_all(&mut map, &rest, DetectionStatus::RunError).await;
                return UnitState::Crashed;
            }
            let expected: u64 = rest.iter().map(MutationDetails::expected_time_ms).sum();
            timeout = self.settings.timeout.timeout_for(expected);
        }
        state
    }

    /// One minion lifetime over `mutants`.
    async fn attempt(
        &self,
        unit_id: u64,
        mutants: &[MutationDetails],
        timeout: std::time::Duration,
        map: &mut StatusMap,
        shutdown: &mut watch::Receiver<bool>,
        publish: bool,
    ) -> Attempt {
        if let Some(first) = mutants.first() {
            map.mark_started(&first.id);
        }

        let mut minion = match MinionProcess::spawn(self.launcher, MinionRole::Mutation).await {
            Ok(minion) => minion,
            Err(ExecutionError::MinionExited(status)) => {
                warn!(unit = unit_id, %status, "minion exited before connecting");
                return Attempt::Crashed(
                    classify_exit(status, false).unwrap_or(DetectionStatus::RunError),
                );
            }
            Err(err) => {
                warn!(unit = unit_id, %err, "could not start minion");
                return Attempt::Crashed(DetectionStatus::RunError);
            }
        };

        let assignment = ParentMessage::Assign(UnitAssignment {
            unit_id,
            mutants: mutants
                .iter()
                .map(|details| MutantAssignment {
                    id: details.id.clone(),
                    tests: self.catalog.resolve(&details.tests_in_order),
                })
                .collect(),
            full_matrix: self.settings.full_matrix,
        });
        if let Err(err) = minion.send(&assignment).await {
            warn!(unit = unit_id, %err, "could not hand unit to minion");
            minion.kill().await;
            return Attempt::Crashed(DetectionStatus::RunError);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let next = tokio::select! {
                message = tokio::time::timeout_at(deadline, minion.recv()) => match message {
                    Ok(message) => Next::Message(message),
                    Err(_) => Next::Deadline,
                },
                _ = shutdown_requested(shutdown) => Next::Shutdown,
            };

            match next {
                Next::Deadline => {
                    debug!(unit = unit_id, ?timeout, "unit exceeded its deadline");
                    minion.kill().await;
                    return Attempt::TimedOut;
                }
                Next::Shutdown => {
                    minion.kill().await;
                    return Attempt::Cancelled;
                }
                Next::Message(Ok(Some(MinionMessage::Describe { id }))) => map.mark_started(&id),
                Next::Message(Ok(Some(MinionMessage::Report { id, pair }))) => {
                    if map.resolve(&id, pair) && publish {
                        self.publish(map, &id).await;
                    }
                }
                Next::Message(Ok(Some(MinionMessage::Done { exit }))) => {
                    minion.finish().await;
                    return Attempt::Finished(exit);
                }
                Next::Message(Ok(Some(MinionMessage::CoverageResult(_)))) => {
                    warn!(unit = unit_id, "mutation minion sent coverage, ignoring");
                }
                Next::Message(Ok(None)) => {
                    let status = minion.finish().await;
                    return Attempt::Crashed(minion.crash_status(status));
                }
                Next::Message(Err(err)) => {
                    warn!(unit = unit_id, %err, "minion stream desynchronised");
                    minion.kill().await;
                    return Attempt::Crashed(DetectionStatus::RunError);
                }
            }
        }
    }

    /// Re-run a mutant one test at a time so that each test's verdict can be
    /// recorded even when some of them bring the minion down.
    async fn isolate(
        &self,
        unit_id: u64,
        details: &MutationDetails,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StatusTestPair {
        let mut combined = StatusTestPair::not_analysed(0, DetectionStatus::RunError);
        for test in &details.tests_in_order {
            let single = details.clone().with_tests(vec![test.clone()]);
            let mut scratch = StatusMap::new(vec![single.clone()]);
            let timeout = self.settings.timeout.timeout_for(test.execution_time_ms);
            let attempt = self
                .attempt(unit_id, &[single], timeout, &mut scratch, shutdown, false)
                .await;

            let pair = match scratch.get(&details.id) {
                Some(pair) if pair.status.is_terminal() => pair.clone(),
                _ => StatusTestPair::not_analysed(1, attempt.unfinished_status()),
            };
            combined.accumulate(&pair, &test.name);
            if attempt == Attempt::Cancelled {
                break;
            }
        }
        combined
    }

    async fn resolve_all(
        &self,
        map: &mut StatusMap,
        mutants: &[MutationDetails],
        status: DetectionStatus,
    ) {
        for details in mutants {
            if map.resolve(&details.id, StatusTestPair::not_analysed(0, status)) {
                self.publish(map, &details.id).await;
            }
        }
    }

    async fn publish(&self, map: &StatusMap, id: &crate::mutation::MutationIdentifier) {
        let Some(result) = map.result(id) else {
            return;
        };
        if self.events.send(ExecutionEvent::Result(result)).await.is_err() {
            debug!(mutant = %id, "result aggregator has gone away");
        }
    }
}
