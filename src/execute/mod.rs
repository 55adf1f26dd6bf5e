//! Worker pool and execution engine.
//!
//! Analysis units run in separate minion processes so a mutant that hangs,
//! crashes or exhausts memory only takes its own minion down. Verdicts flow
//! back to a single aggregator over an `mpsc` channel.

pub mod harness;
pub mod minion;
mod pool;
pub mod process;
pub mod protocol;
#[cfg(all(test, unix))]
pub(crate) mod testing;
mod timeout;
mod unit;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use harness::{
    ACTIVE_MUTANT_ENV, CommandHarness, PROBE_FILE_ENV, TestCatalog, TestHarness, TestOutcome,
    TestSpec,
};
pub use minion::run_minion;
pub use pool::MutationAnalysisExecutor;
pub use process::{MinionProcess, MinionRole, SelfExecLauncher, WorkerLauncher, classify_exit};
pub use protocol::{ExitCode, ProtocolError};
pub use timeout::TimeoutPolicy;

use crate::coverage::{CoverageData, CoverageError, CoverageGenerator};
use crate::model::CodeUnit;
use crate::mutation::MutationResult;
use protocol::{CoverageAssignment, InstrumentedUnit, MinionMessage, ParentMessage};

/// Failures starting or reaching a minion.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The process could not be spawned or its socket set up.
    #[error("failed to start minion: {0}")]
    Spawn(#[source] std::io::Error),
    /// The minion exited before connecting back.
    #[error("minion exited before connecting: {0}")]
    MinionExited(std::process::ExitStatus),
    /// The minion never connected back.
    #[error("minion did not connect within {0:?}")]
    ConnectTimeout(Duration),
}

/// Lifecycle of an analysis unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Waiting in the queue.
    Queued,
    /// Handed to a worker slot.
    Dispatched,
    /// Every mutant reported normally.
    Completed,
    /// At least one minion hit the unit deadline.
    TimedOut,
    /// At least one minion died without finishing.
    Crashed,
    /// Abandoned on shutdown.
    Cancelled,
}

/// Final state of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitReport {
    pub unit_id: u64,
    pub mutants: usize,
    pub state: UnitState,
}

/// Message from a worker slot to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// A mutant reached its final verdict.
    Result(MutationResult),
    /// A unit left the pool.
    UnitFinished { unit_id: u64, state: UnitState },
}

/// Knobs for the pool.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Concurrent minions.
    pub threads: usize,
    /// Run every covering test for every mutant.
    pub full_matrix: bool,
    /// Deadline policy for reruns after a crash.
    pub timeout: TimeoutPolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            full_matrix: false,
            timeout: TimeoutPolicy::default(),
        }
    }
}

/// Collects coverage in a dedicated minion process.
pub struct ProcessCoverageGenerator {
    launcher: Arc<dyn WorkerLauncher>,
    test_timeout: Option<Duration>,
}

impl ProcessCoverageGenerator {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            test_timeout: None,
        }
    }

    /// Kill the minion and give up when any one test runs longer than `limit`.
    pub fn with_test_timeout(mut self, limit: Option<Duration>) -> Self {
        self.test_timeout = limit;
        self
    }

    async fn collect(
        launcher: Arc<dyn WorkerLauncher>,
        assignment: CoverageAssignment,
        test_timeout: Option<Duration>,
    ) -> Result<CoverageData, CoverageError> {
        let expected = assignment.tests.len();
        let mut minion = MinionProcess::spawn(launcher.as_ref(), MinionRole::Coverage).await?;
        minion
            .send(&ParentMessage::CoverageAssign(assignment))
            .await?;

        let mut data = CoverageData::new();
        let mut received = 0;
        loop {
            let next = match test_timeout {
                Some(limit) => match tokio::time::timeout(limit, minion.recv()).await {
                    Ok(next) => next?,
                    Err(_) => {
                        warn!(received, expected, ?limit, "coverage test overran, killing minion");
                        minion.kill().await;
                        return Err(CoverageError::TimedOut(limit));
                    }
                },
                None => minion.recv().await?,
            };
            match next {
                Some(MinionMessage::CoverageResult(result)) => {
                    received += 1;
                    data.calculate(result);
                }
                Some(MinionMessage::Done { exit }) => {
                    minion.finish().await;
                    if !exit.is_ok() {
                        return Err(CoverageError::WorkerFailed(exit));
                    }
                    debug!(tests = received, "coverage collected");
                    return Ok(data);
                }
                Some(other) => debug!(?other, "ignoring unexpected coverage message"),
                None => {
                    minion.finish().await;
                    return Err(CoverageError::WorkerDisconnected { received, expected });
                }
            }
        }
    }
}

impl CoverageGenerator for ProcessCoverageGenerator {
    fn calculate_coverage(
        &self,
        units: &[Arc<CodeUnit>],
        tests: &[TestSpec],
    ) -> impl Future<Output = Result<CoverageData, CoverageError>> + Send {
        let assignment = CoverageAssignment {
            units: units
                .iter()
                .map(|unit| InstrumentedUnit {
                    name: unit.name().clone(),
                    lines: unit.lines().iter().copied().collect(),
                })
                .collect(),
            tests: tests.to_vec(),
        };
        Self::collect(self.launcher.clone(), assignment, self.test_timeout)
    }
}
