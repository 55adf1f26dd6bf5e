//! Choosing and ordering the tests run against each mutant.

use serde::{Deserialize, Serialize};

use crate::coverage::CoverageData;
use crate::mutation::{MutationDetails, TestInfo};

/// Picks the tests that cover a mutant, in the order to run them.
pub trait TestPrioritiser: Send + Sync {
    fn assign_tests(&self, mutant: &MutationDetails, coverage: &CoverageData) -> Vec<TestInfo>;
}

/// Fastest tests first, ties by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrioritiser;

impl TestPrioritiser for DefaultPrioritiser {
    fn assign_tests(&self, mutant: &MutationDetails, coverage: &CoverageData) -> Vec<TestInfo> {
        let mut tests = coverage.tests_for_line(mutant.unit(), mutant.line);
        tests.sort_by(|a, b| {
            a.execution_time_ms
                .cmp(&b.execution_time_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        tests
    }
}

/// Tests in name order, ignoring timings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamePrioritiser;

impl TestPrioritiser for NamePrioritiser {
    fn assign_tests(&self, mutant: &MutationDetails, coverage: &CoverageData) -> Vec<TestInfo> {
        let mut tests = coverage.tests_for_line(mutant.unit(), mutant.line);
        tests.sort_by(|a, b| a.name.cmp(&b.name));
        tests
    }
}

/// Config-selectable prioritiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrioritiserStrategy {
    /// [`DefaultPrioritiser`].
    #[default]
    ExecutionTime,
    /// [`NamePrioritiser`].
    Name,
}

impl PrioritiserStrategy {
    pub fn prioritiser(self) -> Box<dyn TestPrioritiser> {
        match self {
            Self::ExecutionTime => Box::new(DefaultPrioritiser),
            Self::Name => Box::new(NamePrioritiser),
        }
    }
}
