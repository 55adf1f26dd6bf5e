//! Turning candidate mutants into prioritised analysis units.
//!
//! Mutants pass through test assignment, the interceptor chain and the
//! history analyser. Whatever still needs running is batched by a grouper
//! into [`AnalysisUnit`]s, largest first.

mod grouping;
mod intercept;
mod prioritise;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

pub use grouping::{GroupingStrategy, MutationGrouper, PerCodeUnitGrouper, PerMutantGrouper};
pub use intercept::{
    CompoundInterceptor, DuplicateMutantFilter, ExcludedLinesFilter, ExcludedOperatorsFilter,
    InterceptorType, MutationInterceptor, QuorumFilter, TargetUnitsFilter,
};
pub use prioritise::{DefaultPrioritiser, NamePrioritiser, PrioritiserStrategy, TestPrioritiser};

use crate::coverage::CoverageData;
use crate::execute::TimeoutPolicy;
use crate::model::CodeUnit;
use crate::mutation::{
    DetectionStatus, MutationDetails, MutationGenerator, MutationResult, StatusTestPair,
};

/// A batch of mutants analysed by one minion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisUnit {
    /// Position in build order.
    pub id: u64,
    /// Mutants in identifier order.
    pub mutants: Vec<MutationDetails>,
    /// Deadline for the whole batch.
    pub timeout: Duration,
}

impl AnalysisUnit {
    /// Larger units start first.
    pub fn priority(&self) -> usize {
        self.mutants.len()
    }

    pub fn expected_time_ms(&self) -> u64 {
        self.mutants.iter().map(MutationDetails::expected_time_ms).sum()
    }
}

/// Decides, per mutant, whether a verdict is already known.
///
/// Returned results with status `NOT_STARTED` still need analysis; any
/// other status is final. Details may come back with reordered tests.
pub trait MutationAnalyser: Send + Sync {
    fn analyse(&self, mutants: Vec<MutationDetails>) -> Vec<MutationResult>;
}

/// Knows nothing; every mutant needs analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAnalyser;

impl MutationAnalyser for NullAnalyser {
    fn analyse(&self, mutants: Vec<MutationDetails>) -> Vec<MutationResult> {
        mutants
            .into_iter()
            .map(|details| {
                MutationResult::new(
                    details,
                    StatusTestPair::not_analysed(0, DetectionStatus::NotStarted),
                )
            })
            .collect()
    }
}

/// Generates mutants for a unit and attaches their covering tests.
pub struct MutationSource {
    generator: Arc<dyn MutationGenerator>,
    prioritiser: Box<dyn TestPrioritiser>,
    operators: Vec<String>,
}

impl MutationSource {
    pub fn new(
        generator: Arc<dyn MutationGenerator>,
        prioritiser: Box<dyn TestPrioritiser>,
        operators: Vec<String>,
    ) -> Self {
        Self {
            generator,
            prioritiser,
            operators,
        }
    }

    /// Mutants with no tests attached.
    pub fn candidates(&self, unit: &CodeUnit) -> Vec<MutationDetails> {
        self.generator.generate(unit, &self.operators)
    }

    /// Attach covering tests to each mutant.
    pub fn assign_tests(
        &self,
        mutants: Vec<MutationDetails>,
        coverage: &CoverageData,
    ) -> Vec<MutationDetails> {
        mutants
            .into_iter()
            .map(|mutant| {
                let tests = self.prioritiser.assign_tests(&mutant, coverage);
                mutant.with_tests(tests)
            })
            .collect()
    }
}

/// Mutants split by whether they still need a minion.
#[derive(Debug, Default)]
pub struct BuildOutput {
    /// Units to dispatch, largest first.
    pub units: Vec<AnalysisUnit>,
    /// Verdicts known without running anything.
    pub pre_analysed: Vec<MutationResult>,
}

impl BuildOutput {
    /// Every mutant in the output.
    pub fn mutation_count(&self) -> usize {
        self.pre_analysed.len() + self.units.iter().map(|u| u.mutants.len()).sum::<usize>()
    }
}

/// Assembles analysis units.
pub struct MutationTestBuilder {
    interceptors: CompoundInterceptor,
    grouper: Box<dyn MutationGrouper>,
    timeout: TimeoutPolicy,
}

impl MutationTestBuilder {
    pub fn new(
        interceptors: CompoundInterceptor,
        grouper: Box<dyn MutationGrouper>,
        timeout: TimeoutPolicy,
    ) -> Self {
        Self {
            interceptors,
            grouper,
            timeout,
        }
    }

    /// Mutants surviving the interceptors that do not need coverage.
    pub fn prescan(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        self.interceptors.prescan(mutants)
    }

    /// Filter, classify and batch mutants whose tests are already attached.
    pub fn build(
        &self,
        mutants: Vec<MutationDetails>,
        analyser: &dyn MutationAnalyser,
    ) -> BuildOutput {
        let mut mutants = self.interceptors.intercept(mutants);
        mutants.sort_by(|a, b| a.id.cmp(&b.id));

        let mut pending = Vec::new();
        let mut pre_analysed = Vec::new();
        for result in analyser.analyse(mutants) {
            if result.status() != DetectionStatus::NotStarted {
                pre_analysed.push(result);
            } else if !result.details.is_covered() {
                pre_analysed.push(MutationResult::new(
                    result.details,
                    StatusTestPair::not_analysed(0, DetectionStatus::NoCoverage),
                ));
            } else {
                pending.push(result.details);
            }
        }
        pending.sort_by(|a, b| a.id.cmp(&b.id));

        let mut units: Vec<AnalysisUnit> = self
            .grouper
            .group(pending)
            .into_iter()
            .map(|mutants| {
                let expected = mutants.iter().map(MutationDetails::expected_time_ms).sum();
                AnalysisUnit {
                    id: 0,
                    timeout: self.timeout.timeout_for(expected),
                    mutants,
                }
            })
            .collect();
        units.sort_by(|a, b| b.priority().cmp(&a.priority()));
        for (id, unit) in units.iter_mut().enumerate() {
            unit.id = id as u64;
        }

        info!(
            units = units.len(),
            pre_analysed = pre_analysed.len(),
            "built analysis units"
        );
        for unit in &units {
            debug!(unit = unit.id, mutants = unit.mutants.len(), timeout = ?unit.timeout, "analysis unit");
        }
        BuildOutput {
            units,
            pre_analysed,
        }
    }
}
