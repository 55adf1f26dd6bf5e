//! The end-to-end mutation analysis run.
//!
//! Order of work: load history, pick units, pre-scan for mutants, measure
//! coverage (skipping tests history vouches for), check the baseline is
//! green, build analysis units with history short-circuiting, run them on
//! the worker pool and fan results out to listeners.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::build::{
    CompoundInterceptor, DuplicateMutantFilter, ExcludedLinesFilter, ExcludedOperatorsFilter,
    MutationInterceptor, MutationSource, MutationTestBuilder, QuorumFilter, TargetUnitsFilter,
};
use crate::config::{ConfigError, MutationConfig};
use crate::coverage::{CoverageError, CoverageGenerator};
use crate::execute::{
    ExecutionError, ExecutionEvent, MutationAnalysisExecutor, ProcessCoverageGenerator,
    TestCatalog, TestSpec, UnitState, WorkerLauncher,
};
use crate::history::{
    CodeHistory, FileHistoryStore, HistoryError, HistoryStore, IncrementalAnalyser,
};
use crate::model::{CodeRepository, CodeUnitName};
use crate::mutation::{ClassMutationResults, MutationDetails, MutationGenerator, MutationResult};
use crate::project::{CodeModelError, Project};
use crate::report::ReportListener;
use crate::stats::{
    CombinedStatistics, CompoundListener, HistoryListener, MutationResultListener,
    StatisticsAggregator, StatisticsListener,
};

/// Failing tests named in a red-baseline error before the rest are counted.
const MAX_FAILING_TESTS_LISTED: usize = 10;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Tests fail against unmutated code.
    #[error("build not suitable for mutation testing: {0}")]
    BuildNotSuitable(String),
    /// Nothing to mutate and the run is configured to fail on that.
    #[error("no mutations found; check the target units and enabled operators")]
    NoMutations,
    /// The finished run missed one of its thresholds.
    #[error("{}", .0.join("; "))]
    ThresholdNotMet(Vec<String>),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    CodeModel(#[from] CodeModelError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Error message for a red baseline.
fn describe_failing_tests(failing: &[String]) -> String {
    let listed: Vec<&str> = failing
        .iter()
        .take(MAX_FAILING_TESTS_LISTED)
        .map(String::as_str)
        .collect();
    let mut message = format!(
        "{} test(s) did not pass without mutation: {}",
        failing.len(),
        listed.join(", ")
    );
    if failing.len() > MAX_FAILING_TESTS_LISTED {
        message.push_str(&format!(
            " and {} more",
            failing.len() - MAX_FAILING_TESTS_LISTED
        ));
    }
    message
}

/// Fail with [`PipelineError::ThresholdNotMet`] when `stats` misses any of
/// the configured thresholds.
pub fn check_thresholds(
    config: &MutationConfig,
    stats: &CombinedStatistics,
) -> Result<(), PipelineError> {
    let violations = config.threshold_checker().violations(stats);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ThresholdNotMet(violations))
    }
}

/// One configured mutation run.
pub struct MutationCoverage<C> {
    config: MutationConfig,
    repo: CodeRepository,
    generator: Arc<dyn MutationGenerator>,
    tests: Vec<TestSpec>,
    coverage: C,
    launcher: Arc<dyn WorkerLauncher>,
    history: Arc<Mutex<dyn HistoryStore>>,
    listeners: Vec<Box<dyn MutationResultListener>>,
    shutdown: watch::Receiver<bool>,
    // Keeps the default shutdown channel open when no signal is wired up.
    _shutdown_tx: Option<watch::Sender<bool>>,
}

impl<C: CoverageGenerator> MutationCoverage<C> {
    pub fn new(
        config: MutationConfig,
        repo: CodeRepository,
        generator: Arc<dyn MutationGenerator>,
        tests: Vec<TestSpec>,
        coverage: C,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let history = FileHistoryStore::new(
            config.history_input.as_deref().map(|p| config.resolve(p)),
            config.history_output.as_deref().map(|p| config.resolve(p)),
        );
        let (tx, rx) = watch::channel(false);
        Self {
            config,
            repo,
            generator,
            tests,
            coverage,
            launcher,
            history: Arc::new(Mutex::new(history)),
            listeners: Vec::new(),
            shutdown: rx,
            _shutdown_tx: Some(tx),
        }
    }

    /// Replace the history store built from the config paths.
    pub fn with_history(mut self, history: Arc<Mutex<dyn HistoryStore>>) -> Self {
        self.history = history;
        self
    }

    /// Add a listener notified after the built-in ones.
    pub fn with_listener(mut self, listener: Box<dyn MutationResultListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Stop dispatching and kill running minions once this flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self._shutdown_tx = None;
        self
    }

    fn interceptors(&self) -> CompoundInterceptor {
        let mut children: Vec<Box<dyn MutationInterceptor>> = vec![
            Box::new(TargetUnitsFilter::new(self.config.target_units.clone())),
            Box::new(DuplicateMutantFilter),
        ];
        if !self.config.excluded_lines.is_empty() {
            children.push(Box::new(ExcludedLinesFilter::parse(
                self.config.excluded_lines.iter().map(String::as_str),
            )));
        }
        if !self.config.excluded_operators.is_empty() {
            children.push(Box::new(ExcludedOperatorsFilter::new(
                self.config.excluded_operators.clone(),
            )));
        }
        if self.config.min_covering_tests > 0 {
            children.push(Box::new(QuorumFilter::new(self.config.min_covering_tests)));
        }
        CompoundInterceptor::new(children)
    }

    /// Apply the empty-run policy.
    fn no_mutations(&self, issues: &mut Vec<String>) -> Result<(), PipelineError> {
        if self.config.fail_when_no_mutations {
            return Err(PipelineError::NoMutations);
        }
        warn!("no mutations found");
        issues.push("No mutations found. This probably means there is an issue with either the supplied target units or operators.".to_string());
        Ok(())
    }

    /// Run the whole analysis.
    pub async fn run_report(self) -> Result<CombinedStatistics, PipelineError> {
        let mut issues = Vec::new();
        let previous = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.initialize().clone()
        };
        if previous.malformed_lines > 0 {
            issues.push(format!(
                "History contained {} unreadable record(s); they were ignored.",
                previous.malformed_lines
            ));
        }

        let targets = TargetUnitsFilter::new(self.config.target_units.clone());
        let all_units = self.repo.all_units();
        let mutable_units: Vec<_> = all_units
            .iter()
            .filter(|unit| !unit.is_interface() && targets.matches(unit.name()))
            .cloned()
            .collect();

        let source = MutationSource::new(
            self.generator.clone(),
            self.config.prioritiser.prioritiser(),
            self.config.operators.clone(),
        );
        let builder = MutationTestBuilder::new(
            self.interceptors(),
            self.config.grouping.grouper(self.config.mutation_unit_size),
            self.config.timeout_policy(),
        );

        let candidates: Vec<MutationDetails> = mutable_units
            .iter()
            .flat_map(|unit| source.candidates(unit))
            .collect();
        let prescanned = builder.prescan(candidates.clone());
        info!(
            units = mutable_units.len(),
            candidates = candidates.len(),
            after_prescan = prescanned.len(),
            "pre-scan finished"
        );
        if prescanned.is_empty() {
            self.no_mutations(&mut issues)?;
            return Ok(CombinedStatistics {
                issues,
                ..CombinedStatistics::default()
            });
        }

        let limited = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.limit_tests(self.tests.clone(), &self.repo)
        };
        let mut coverage = self
            .coverage
            .calculate_coverage(&all_units, &limited.to_run)
            .await?;
        for replayed in limited.replayed {
            coverage.calculate(replayed);
        }
        if !coverage.all_tests_green() {
            return Err(PipelineError::BuildNotSuitable(describe_failing_tests(
                coverage.failing_tests(),
            )));
        }
        let unit_names: Vec<CodeUnitName> = all_units.iter().map(|u| u.name().clone()).collect();
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_coverage(&coverage, &self.repo, &unit_names);

        let assigned = source.assign_tests(candidates, &coverage);
        let analyser = IncrementalAnalyser::new(
            CodeHistory::new(&self.repo, &previous.units, &previous.results),
            &coverage,
        );
        let output = builder.build(assigned, &analyser);
        info!(
            mutations = output.mutation_count(),
            units = output.units.len(),
            "built mutation tests"
        );
        if output.mutation_count() == 0 {
            self.no_mutations(&mut issues)?;
        }

        let mutated_units: BTreeSet<CodeUnitName> = output
            .pre_analysed
            .iter()
            .map(|r| r.details.unit().clone())
            .chain(
                output
                    .units
                    .iter()
                    .flat_map(|u| u.mutants.iter().map(|m| m.unit().clone())),
            )
            .collect();
        let mutated_units: Vec<CodeUnitName> = mutated_units.into_iter().collect();
        let coverage_summary = coverage.summary(&mutated_units, &self.repo);

        let aggregator = Arc::new(Mutex::new(StatisticsAggregator::new()));
        let mut listeners = CompoundListener::new(vec![Box::new(StatisticsListener::new(
            aggregator.clone(),
        ))]);
        if !self.config.output_formats.is_empty() {
            listeners.push(Box::new(ReportListener::new(
                self.config.resolve(&self.config.report_dir),
                self.config.output_formats.clone(),
            )));
        }
        for listener in self.listeners {
            listeners.push(listener);
        }
        listeners.push(Box::new(HistoryListener::new(self.history.clone())));

        listeners.run_start();
        for results in group_by_unit(output.pre_analysed) {
            listeners.handle_mutation_result(&results);
        }

        let executor = MutationAnalysisExecutor::new(
            self.launcher.clone(),
            self.config.execution_settings(),
            Arc::new(TestCatalog::new(self.tests.iter().cloned())),
            self.shutdown.clone(),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let aggregate = async {
            while let Some(event) = rx.recv().await {
                if let ExecutionEvent::Result(result) = event {
                    listeners.handle_mutation_result(&ClassMutationResults::new(vec![result]));
                }
            }
        };
        let (reports, ()) = tokio::join!(executor.run(output.units, tx), aggregate);

        let cancelled = reports
            .iter()
            .filter(|r| r.state == UnitState::Cancelled)
            .count();
        if cancelled > 0 {
            issues.push(format!(
                "Run was interrupted; {cancelled} analysis unit(s) did not complete."
            ));
        }
        listeners.run_end();

        let mutation_statistics = aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_statistics();
        Ok(CombinedStatistics {
            mutation_statistics,
            coverage_summary,
            issues,
        })
    }
}

impl MutationCoverage<ProcessCoverageGenerator> {
    /// A run over a manifest project, measuring coverage in a minion.
    pub fn for_project(
        project: &Project,
        config: MutationConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let coverage = ProcessCoverageGenerator::new(launcher.clone())
            .with_test_timeout(Some(config.coverage_timeout()));
        Self::new(
            config,
            CodeRepository::new(project.code_source()),
            project.mutator(),
            project.tests(),
            coverage,
            launcher,
        )
    }
}

/// Split results into per-unit batches, in unit order.
fn group_by_unit(results: Vec<MutationResult>) -> Vec<ClassMutationResults> {
    let mut by_unit: BTreeMap<CodeUnitName, Vec<MutationResult>> = BTreeMap::new();
    for result in results {
        by_unit
            .entry(result.details.unit().clone())
            .or_default()
            .push(result);
    }
    by_unit
        .into_values()
        .map(ClassMutationResults::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::process::Command;

    use super::*;
    use crate::coverage::LocalCoverageRunner;
    use crate::execute::{MinionRole, TestHarness, TestOutcome};
    use crate::model::CodeUnit;
    use crate::model::tests::{MapSource, unit};
    use crate::mutation::{DetectionStatus, MutationIdentifier};

    /// Tests named `red*` fail; everything else passes and covers `a.A:1`.
    struct ScriptedHarness;

    impl TestHarness for ScriptedHarness {
        fn activate(&self, _: Option<&MutationIdentifier>) -> Result<(), String> {
            Ok(())
        }

        fn execute(&self, test: &TestSpec, probe_file: Option<&Path>) -> TestOutcome {
            if let Some(path) = probe_file {
                std::fs::write(path, "a.A:1\n").expect("probe file should be writable");
            }
            if test.name.starts_with("red") {
                TestOutcome::Failed {
                    message: "red".to_string(),
                }
            } else {
                TestOutcome::Passed
            }
        }
    }

    /// Any attempt to start a minion fails to spawn.
    struct NoMinions;

    impl WorkerLauncher for NoMinions {
        fn command(&self, _: MinionRole, _: u16) -> Command {
            Command::new("/nonexistent/mutascope-minion")
        }
    }

    struct OneMutant;

    impl MutationGenerator for OneMutant {
        fn generate(&self, unit: &CodeUnit, _: &[String]) -> Vec<MutationDetails> {
            if unit.name().as_str() == "a.A" {
                vec![MutationDetails::new(
                    MutationIdentifier::new("a.A", "m", 0, "OP"),
                    2,
                    "uncovered line",
                )]
            } else {
                Vec::new()
            }
        }
    }

    fn run(
        config: MutationConfig,
        tests: Vec<TestSpec>,
    ) -> MutationCoverage<LocalCoverageRunner<ScriptedHarness>> {
        MutationCoverage::new(
            config.with_output_formats(Vec::new()),
            CodeRepository::new(Arc::new(MapSource::with(vec![unit("a.A", "a", &[1, 2])]))),
            Arc::new(OneMutant),
            tests,
            LocalCoverageRunner::new(Arc::new(ScriptedHarness)),
            Arc::new(NoMinions),
        )
    }

    #[test]
    fn red_baseline_message_lists_at_most_ten_tests() {
        let failing: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let message = describe_failing_tests(&failing);
        assert!(message.starts_with("12 test(s)"));
        assert!(message.contains("t9"));
        assert!(!message.contains("t10"));
        assert!(message.ends_with("and 2 more"));
    }

    #[tokio::test]
    async fn red_baseline_aborts_the_run() {
        let err = run(
            MutationConfig::default(),
            vec![TestSpec::new("green", "true"), TestSpec::new("red_one", "false")],
        )
        .run_report()
        .await
        .expect_err("red baseline should fail the run");
        match err {
            PipelineError::BuildNotSuitable(message) => assert!(message.contains("red_one")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn uncovered_mutant_is_reported_without_a_minion() {
        let stats = run(MutationConfig::default(), vec![TestSpec::new("green", "true")])
            .run_report()
            .await
            .expect("run should succeed without dispatching");
        let mutation = &stats.mutation_statistics;
        assert_eq!(mutation.total_mutations, 1);
        assert_eq!(mutation.count(DetectionStatus::NoCoverage), 1);
        assert_eq!(mutation.percentage_detected(), 0);
        assert_eq!(stats.coverage_summary.total_lines, 2);
        assert_eq!(stats.coverage_summary.covered_lines, 1);
    }

    #[tokio::test]
    async fn empty_run_follows_the_configured_policy() {
        let failing = run(
            MutationConfig::default().with_target_units(vec!["nothing.*".to_string()]),
            vec![TestSpec::new("green", "true")],
        )
        .run_report()
        .await;
        assert!(matches!(failing, Err(PipelineError::NoMutations)));

        let stats = run(
            MutationConfig::default()
                .with_target_units(vec!["nothing.*".to_string()])
                .with_fail_when_no_mutations(false),
            vec![TestSpec::new("green", "true")],
        )
        .run_report()
        .await
        .expect("warn policy should not fail the run");
        assert_eq!(stats.issues.len(), 1);
        assert_eq!(stats.mutation_statistics.percentage_detected(), 100);
    }

    /// One mutant on the line every passing test covers.
    struct CoveredMutant;

    impl MutationGenerator for CoveredMutant {
        fn generate(&self, unit: &CodeUnit, _: &[String]) -> Vec<MutationDetails> {
            vec![MutationDetails::new(
                MutationIdentifier::new(unit.name().as_str(), "m", 0, "OP"),
                1,
                "covered line",
            )]
        }
    }

    #[tokio::test]
    async fn interrupted_run_still_reports_every_mutant() {
        let (_stop, shutdown) = watch::channel(true);
        let stats = MutationCoverage::new(
            MutationConfig::default().with_output_formats(Vec::new()),
            CodeRepository::new(Arc::new(MapSource::with(vec![unit("a.A", "a", &[1, 2])]))),
            Arc::new(CoveredMutant),
            vec![TestSpec::new("green", "true")],
            LocalCoverageRunner::new(Arc::new(ScriptedHarness)),
            Arc::new(NoMinions),
        )
        .with_shutdown(shutdown)
        .run_report()
        .await
        .expect("interrupted run should still produce a report");

        assert_eq!(stats.mutation_statistics.total_mutations, 1);
        assert_eq!(stats.mutation_statistics.count(DetectionStatus::RunError), 1);
        assert!(
            stats
                .issues
                .iter()
                .any(|issue| issue.starts_with("Run was interrupted; 1 analysis unit(s)")),
            "issues were {:?}",
            stats.issues
        );
    }

    #[test]
    fn thresholds_fail_the_run() {
        let stats = CombinedStatistics::default();
        assert!(check_thresholds(&MutationConfig::default(), &stats).is_ok());

        let mut stats = stats;
        stats.mutation_statistics.total_mutations = 4;
        stats.mutation_statistics.total_survived = 4;
        let config = MutationConfig::default().with_mutation_threshold(50);
        assert!(matches!(
            check_thresholds(&config, &stats),
            Err(PipelineError::ThresholdNotMet(v)) if v.len() == 1
        ));
    }
}
