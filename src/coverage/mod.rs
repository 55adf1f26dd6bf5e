//! Per-test coverage collection.
//!
//! Every test runs once against unmutated code with probes recording which
//! lines it reaches. The resulting [`CoverageData`] drives test selection
//! for every mutant and doubles as the green-baseline check.

mod data;
mod probe;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

pub use data::{CoverageData, CoverageResult, CoverageSummary};
pub use probe::{ProbeHit, ProbeRegistry};

use crate::execute::{ExecutionError, ExitCode, ProtocolError, TestHarness, TestSpec};
use crate::model::CodeUnit;
use crate::mutation::TestInfo;

/// Coverage collection failures.
#[derive(Debug, Error)]
pub enum CoverageError {
    /// The coverage worker could not be started.
    #[error("coverage worker failed to start: {0}")]
    Launch(#[from] ExecutionError),
    /// Framing failure talking to the coverage worker.
    #[error("coverage protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The coverage worker reported a failure exit.
    #[error("coverage worker exited with {0:?}")]
    WorkerFailed(ExitCode),
    /// The coverage worker went away before finishing.
    #[error("coverage worker disconnected after {received} of {expected} tests")]
    WorkerDisconnected {
        /// Results received.
        received: usize,
        /// Tests assigned.
        expected: usize,
    },
    /// The coverage worker did not finish in time.
    #[error("coverage worker did not finish within {0:?}")]
    TimedOut(std::time::Duration),
    /// The in-process runner panicked or was cancelled.
    #[error("coverage task failed: {0}")]
    Task(String),
}

/// Produces coverage for a set of code units.
pub trait CoverageGenerator {
    /// Run `tests` once each against unmutated code, recording which lines
    /// of `units` they reach.
    fn calculate_coverage(
        &self,
        units: &[Arc<CodeUnit>],
        tests: &[TestSpec],
    ) -> impl Future<Output = Result<CoverageData, CoverageError>> + Send;
}

/// Run `tests` against unmutated code, handing each result to `sink` as it
/// completes.
pub fn measure_tests<E>(
    harness: &dyn TestHarness,
    registry: &mut ProbeRegistry,
    tests: &[TestSpec],
    mut sink: impl FnMut(CoverageResult) -> Result<(), E>,
) -> Result<(), E> {
    if let Err(reason) = harness.activate(None) {
        warn!(%reason, "could not restore unmutated code before coverage");
    }
    for test in tests {
        let probes = match tempfile::NamedTempFile::new() {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(test = %test.name, %err, "no probe file, coverage for this test is lost");
                None
            }
        };

        let started = Instant::now();
        let outcome = harness.execute(test, probes.as_ref().map(|f| f.path()));
        let elapsed = started.elapsed();

        let hits = probes
            .as_ref()
            .and_then(|file| std::fs::read_to_string(file.path()).ok())
            .map(|raw| raw.lines().filter_map(ProbeHit::parse).collect::<Vec<_>>())
            .unwrap_or_default();
        let visited = registry.filter(hits);

        debug!(
            test = %test.name,
            passed = outcome.passed(),
            probes = visited.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "measured test"
        );
        sink(CoverageResult {
            test: TestInfo {
                name: test.name.clone(),
                execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                defining_unit: test.defining_unit.clone(),
                probes_hit: 0,
            },
            passed: outcome.passed(),
            visited,
        })?;
    }
    Ok(())
}

/// Collects coverage in the calling process.
///
/// Useful when the harness is itself isolated (for instance the shell
/// harness), or in tests. The blocking test runs are moved off the async
/// runtime.
pub struct LocalCoverageRunner<H> {
    harness: Arc<H>,
}

impl<H: TestHarness + 'static> LocalCoverageRunner<H> {
    pub fn new(harness: Arc<H>) -> Self {
        Self { harness }
    }
}

impl<H: TestHarness + 'static> CoverageGenerator for LocalCoverageRunner<H> {
    fn calculate_coverage(
        &self,
        units: &[Arc<CodeUnit>],
        tests: &[TestSpec],
    ) -> impl Future<Output = Result<CoverageData, CoverageError>> + Send {
        let harness = self.harness.clone();
        let mut registry = ProbeRegistry::new();
        for unit in units {
            registry.register(unit.name().clone(), unit.lines().iter().copied());
        }
        let tests = tests.to_vec();

        async move {
            tokio::task::spawn_blocking(move || -> Result<CoverageData, CoverageError> {
                let mut data = CoverageData::new();
                measure_tests(harness.as_ref(), &mut registry, &tests, |result| {
                    data.calculate(result);
                    Ok::<(), CoverageError>(())
                })?;
                Ok(data)
            })
            .await
            .map_err(|err| CoverageError::Task(err.to_string()))?
        }
    }
}
