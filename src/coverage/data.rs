//! Aggregated per-test line coverage.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::probe::ProbeHit;
use crate::model::{CodeRepository, CodeUnitName, ContentHash};
use crate::mutation::TestInfo;

/// Outcome of running one test under coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageResult {
    /// The test, with its measured execution time.
    pub test: TestInfo,
    /// Whether the test passed against unmutated code.
    pub passed: bool,
    /// Probes the test visited.
    pub visited: Vec<ProbeHit>,
}

/// Line coverage totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Code lines across the measured units.
    pub total_lines: usize,
    /// Code lines visited by at least one test.
    pub covered_lines: usize,
}

impl CoverageSummary {
    /// Percentage of lines covered, 100 when there is nothing to cover.
    pub fn coverage_percent(&self) -> u32 {
        crate::stats::percentage(self.covered_lines as u64, self.total_lines as u64)
    }
}

/// Mapping from code lines to the tests that reach them.
///
/// Built once by the coverage run and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CoverageData {
    lines: BTreeMap<CodeUnitName, BTreeMap<u32, BTreeSet<TestInfo>>>,
    results: BTreeMap<String, CoverageResult>,
    failing: Vec<String>,
}

impl CoverageData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one test's coverage into the map.
    pub fn calculate(&mut self, mut result: CoverageResult) {
        result.test.probes_hit = u32::try_from(result.visited.len()).unwrap_or(u32::MAX);
        if !result.passed {
            self.failing.push(result.test.name.clone());
        }
        for hit in &result.visited {
            self.lines
                .entry(hit.unit.clone())
                .or_default()
                .entry(hit.line)
                .or_default()
                .insert(result.test.clone());
        }
        self.results.insert(result.test.name.clone(), result);
    }

    /// Tests reaching `unit:line`, in name order.
    pub fn tests_for_line(&self, unit: &CodeUnitName, line: u32) -> Vec<TestInfo> {
        self.lines
            .get(unit)
            .and_then(|lines| lines.get(&line))
            .map(|tests| tests.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct tests reaching any line of `unit`, fastest first, ties by name.
    pub fn tests_for_unit(&self, unit: &CodeUnitName) -> Vec<TestInfo> {
        let mut tests: Vec<TestInfo> = self
            .lines
            .get(unit)
            .map(|lines| {
                lines
                    .values()
                    .flatten()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        tests.sort_by(|a, b| {
            a.execution_time_ms
                .cmp(&b.execution_time_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        tests
    }

    /// Number of lines of `units` reached by any test.
    pub fn covered_lines(&self, units: &[CodeUnitName]) -> usize {
        units
            .iter()
            .filter_map(|unit| self.lines.get(unit))
            .map(BTreeMap::len)
            .sum()
    }

    /// Identity of the tests covering `unit`, or `None` when nothing covers
    /// it. Changes whenever a covering test's defining unit changes or the
    /// set of covering tests changes.
    pub fn coverage_id_for_unit(
        &self,
        unit: &CodeUnitName,
        repo: &CodeRepository,
    ) -> Option<ContentHash> {
        let tests = self.tests_for_unit(unit);
        if tests.is_empty() {
            return None;
        }
        let parts: BTreeSet<ContentHash> = tests
            .iter()
            .map(|test| {
                test.defining_unit
                    .as_ref()
                    .and_then(|defining| repo.hierarchical_hash(defining))
                    .unwrap_or_else(|| ContentHash::of(test.name.as_bytes()))
            })
            .collect();
        Some(ContentHash::combine(&parts))
    }

    pub fn all_tests_green(&self) -> bool {
        self.failing.is_empty()
    }

    /// Tests that failed against unmutated code, in run order.
    pub fn failing_tests(&self) -> &[String] {
        &self.failing
    }

    /// Every test seen, in name order.
    pub fn all_tests(&self) -> Vec<TestInfo> {
        self.results.values().map(|r| r.test.clone()).collect()
    }

    /// Raw per-test results, in test name order.
    pub fn results(&self) -> impl Iterator<Item = &CoverageResult> {
        self.results.values()
    }

    /// Line totals over `units`.
    pub fn summary(&self, units: &[CodeUnitName], repo: &CodeRepository) -> CoverageSummary {
        let total_lines = units
            .iter()
            .filter_map(|unit| repo.fetch(unit))
            .map(|unit| unit.number_of_code_lines())
            .sum();
        CoverageSummary {
            total_lines,
            covered_lines: self.covered_lines(units),
        }
    }
}
