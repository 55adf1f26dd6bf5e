//! Fixed-size pool of worker slots draining the analysis-unit queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::harness::TestCatalog;
use super::process::WorkerLauncher;
use super::unit::UnitRunner;
use super::{ExecutionEvent, ExecutionSettings, UnitReport, UnitState};
use crate::build::AnalysisUnit;
use crate::mutation::{DetectionStatus, StatusMap, StatusTestPair};

/// Runs analysis units on up to `threads` minions at a time.
///
/// Units are taken from the front of a shared queue, so they start in the
/// order they were built. Each slot owns at most one minion at a time.
pub struct MutationAnalysisExecutor {
    launcher: Arc<dyn WorkerLauncher>,
    settings: ExecutionSettings,
    catalog: Arc<TestCatalog>,
    shutdown: watch::Receiver<bool>,
}

impl MutationAnalysisExecutor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        settings: ExecutionSettings,
        catalog: Arc<TestCatalog>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            launcher,
            settings,
            catalog,
            shutdown,
        }
    }

    /// Analyse every unit, sending each verdict to `events` as it is reached.
    ///
    /// Returns once every unit has finished or been abandoned on shutdown.
    pub async fn run(
        &self,
        units: Vec<AnalysisUnit>,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Vec<UnitReport> {
        let total = units.len();
        let slots = self.settings.threads.max(1).min(total.max(1));
        info!(units = total, slots, "starting mutation analysis");

        let queue = Arc::new(Mutex::new(VecDeque::from(units)));
        let mut tasks = JoinSet::new();
        for slot in 0..slots {
            let queue = queue.clone();
            let launcher = self.launcher.clone();
            let settings = self.settings.clone();
            let catalog = self.catalog.clone();
            let events = events.clone();
            let mut shutdown = self.shutdown.clone();

            tasks.spawn(async move {
                let mut reports = Vec::new();
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(unit) = next else {
                        break;
                    };

                    debug!(slot, unit = unit.id, mutants = unit.mutants.len(), state = ?UnitState::Dispatched, "dispatching analysis unit");
                    let runner = UnitRunner {
                        launcher: launcher.as_ref(),
                        settings: &settings,
                        catalog: &catalog,
                        events: &events,
                    };
                    let state = runner.run(&unit, &mut shutdown).await;
                    debug!(slot, unit = unit.id, ?state, "analysis unit finished");

                    let _ = events
                        .send(ExecutionEvent::UnitFinished {
                            unit_id: unit.id,
                            state,
                        })
                        .await;
                    reports.push(UnitReport {
                        unit_id: unit.id,
                        mutants: unit.mutants.len(),
                        state,
                    });
                }
                reports
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(slot_reports) => reports.extend(slot_reports),
                Err(err) => warn!(%err, "worker slot failed"),
            }
        }

        let abandoned: Vec<AnalysisUnit> = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !abandoned.is_empty() {
            warn!(units = abandoned.len(), "shutdown requested, abandoning queued units");
        }
        for unit in abandoned {
            let mut map = StatusMap::new(unit.mutants.iter().cloned());
            map.mark_uncovered();
            for details in map.unrun() {
                map.resolve(
                    &details.id,
                    StatusTestPair::not_analysed(0, DetectionStatus::RunError),
                );
            }
            for result in map.into_results() {
                let _ = events.send(ExecutionEvent::Result(result)).await;
            }
            reports.push(UnitReport {
                unit_id: unit.id,
                mutants: unit.mutants.len(),
                state: UnitState::Cancelled,
            });
        }

        reports.sort_by_key(|r| r.unit_id);
        reports
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::execute::ExitCode;
    use crate::execute::protocol::{MinionMessage, ParentMessage};
    use crate::execute::testing::{Script, ScriptedLauncher, assigned_ids};
    use crate::mutation::{MutationDetails, MutationIdentifier, TestInfo};

    fn unit(id: u64, operator: &str) -> AnalysisUnit {
        AnalysisUnit {
            id,
            mutants: vec![
                MutationDetails::new(MutationIdentifier::new("a.A", "m", 0, operator), 1, operator)
                    .with_tests(vec![TestInfo::new("t", 5)]),
            ],
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn shutdown_mid_run_kills_the_minion_and_abandons_the_queue() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![Script::stall(|_| Vec::new())]));
        let (stop, shutdown) = watch::channel(false);
        let executor = MutationAnalysisExecutor::new(
            launcher.clone(),
            ExecutionSettings::default(),
            Arc::new(TestCatalog::default()),
            shutdown,
        );
        let (events, mut rx) = mpsc::channel(16);

        let interrupt = async {
            launcher.wait_for_work(1).await;
            stop.send(true).expect("executor should still be listening");
        };
        let started = tokio::time::Instant::now();
        let (reports, ()) = tokio::join!(
            executor.run(vec![unit(1, "RUNNING"), unit(2, "QUEUED")], events),
            interrupt
        );
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "shutdown should not wait for the unit deadline"
        );

        let states: Vec<(u64, UnitState)> = reports.iter().map(|r| (r.unit_id, r.state)).collect();
        assert_eq!(
            states,
            vec![(1, UnitState::Cancelled), (2, UnitState::Cancelled)]
        );

        let mut statuses = BTreeMap::new();
        let mut finished = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::Result(result) => {
                    statuses.insert(result.details.operator().to_string(), result.status());
                }
                ExecutionEvent::UnitFinished { unit_id, state } => finished.push((unit_id, state)),
            }
        }
        assert_eq!(statuses["RUNNING"], DetectionStatus::RunError);
        assert_eq!(statuses["QUEUED"], DetectionStatus::RunError);
        assert_eq!(finished, vec![(1, UnitState::Cancelled)]);
        assert_eq!(launcher.received().len(), 1, "queued unit should never reach a minion");
    }

    #[tokio::test]
    async fn units_run_in_queue_order_on_a_single_slot() {
        let done = |message: &ParentMessage| {
            let ids = assigned_ids(message);
            vec![
                MinionMessage::Report {
                    id: ids[0].clone(),
                    pair: StatusTestPair::killed_by(1, "t"),
                },
                MinionMessage::Done { exit: ExitCode::Ok },
            ]
        };
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            Script::reply(done),
            Script::reply(done),
        ]));
        let (_stop, shutdown) = watch::channel(false);
        let executor = MutationAnalysisExecutor::new(
            launcher.clone(),
            ExecutionSettings::default(),
            Arc::new(TestCatalog::default()),
            shutdown,
        );
        let (events, mut rx) = mpsc::channel(16);

        let reports = executor
            .run(vec![unit(1, "FIRST"), unit(2, "SECOND")], events)
            .await;

        assert!(reports.iter().all(|r| r.state == UnitState::Completed));
        let mut order = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::Result(result) = event {
                assert_eq!(result.status(), DetectionStatus::Killed);
                order.push(result.details.operator().to_string());
            }
        }
        assert_eq!(order, vec!["FIRST", "SECOND"]);
    }
}
