//! Reusing verdicts from a previous run.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use super::UnitHistory;
use crate::build::MutationAnalyser;
use crate::coverage::CoverageData;
use crate::model::{CodeRepository, CodeUnitName, ContentHash};
use crate::mutation::{
    DetectionStatus, MutationDetails, MutationIdentifier, MutationResult, StatusTestPair,
};

/// Previous run's view of the code, compared against the current one.
pub struct CodeHistory<'a> {
    repo: &'a CodeRepository,
    units: &'a HashMap<CodeUnitName, UnitHistory>,
    results: &'a HashMap<MutationIdentifier, StatusTestPair>,
}

impl<'a> CodeHistory<'a> {
    pub fn new(
        repo: &'a CodeRepository,
        units: &'a HashMap<CodeUnitName, UnitHistory>,
        results: &'a HashMap<MutationIdentifier, StatusTestPair>,
    ) -> Self {
        Self {
            repo,
            units,
            results,
        }
    }

    /// True for units that are new, gone, or whose hierarchical hash moved.
    pub fn has_unit_changed(&self, name: &CodeUnitName) -> bool {
        match self.units.get(name) {
            None => true,
            Some(previous) => {
                self.repo.hierarchical_hash(name).as_ref() != Some(&previous.hierarchical_hash)
            }
        }
    }

    pub fn has_coverage_changed(&self, name: &CodeUnitName, current: Option<&ContentHash>) -> bool {
        match self.units.get(name) {
            None => true,
            Some(previous) => previous.coverage_id.as_ref() != current,
        }
    }

    pub fn previous_result(&self, id: &MutationIdentifier) -> Option<&StatusTestPair> {
        self.results.get(id)
    }
}

/// [`MutationAnalyser`] backed by a previous run's history.
pub struct IncrementalAnalyser<'a> {
    history: CodeHistory<'a>,
    coverage: &'a CoverageData,
}

impl<'a> IncrementalAnalyser<'a> {
    pub fn new(history: CodeHistory<'a>, coverage: &'a CoverageData) -> Self {
        Self { history, coverage }
    }

    fn analyse_from_history(
        &self,
        mut details: MutationDetails,
        previous: &StatusTestPair,
    ) -> MutationResult {
        let unit = details.unit().clone();

        if self.history.has_unit_changed(&unit) {
            if let Some(test) = previous.killing_test() {
                details.prioritise_test(test);
            }
            return not_started(details);
        }

        match previous.status {
            DetectionStatus::TimedOut => reused(details, DetectionStatus::TimedOut, Vec::new(), Vec::new()),
            DetectionStatus::Killed => {
                let still_killing = self.unchanged_killing_tests(&unit, previous);
                if !still_killing.is_empty() {
                    return reused(
                        details,
                        DetectionStatus::Killed,
                        still_killing,
                        previous.succeeding_tests.clone(),
                    );
                }
                if let Some(test) = previous.killing_test() {
                    details.prioritise_test(test);
                }
                not_started(details)
            }
            DetectionStatus::Survived
                if !self.history.has_coverage_changed(
                    &unit,
                    self.coverage
                        .coverage_id_for_unit(&unit, self.history.repo)
                        .as_ref(),
                ) =>
            {
                reused(details, DetectionStatus::Survived, Vec::new(), Vec::new())
            }
            _ => not_started(details),
        }
    }

    /// Previous killing tests that still cover `unit` and whose defining unit
    /// is unchanged. Tests without a defining unit never qualify.
    fn unchanged_killing_tests(&self, unit: &CodeUnitName, previous: &StatusTestPair) -> Vec<String> {
        self.coverage
            .tests_for_unit(unit)
            .into_iter()
            .filter(|test| previous.killing_tests.contains(&test.name))
            .filter(|test| {
                test.defining_unit
                    .as_ref()
                    .is_some_and(|defining| !self.history.has_unit_changed(defining))
            })
            .map(|test| test.name)
            .collect()
    }
}

fn not_started(details: MutationDetails) -> MutationResult {
    MutationResult::new(
        details,
        StatusTestPair::not_analysed(0, DetectionStatus::NotStarted),
    )
}

fn reused(
    details: MutationDetails,
    status: DetectionStatus,
    killing_tests: Vec<String>,
    succeeding_tests: Vec<String>,
) -> MutationResult {
    let mut pair = StatusTestPair::not_analysed(0, status);
    pair.killing_tests = killing_tests;
    pair.succeeding_tests = succeeding_tests;
    MutationResult::new(details, pair)
}

impl MutationAnalyser for IncrementalAnalyser<'_> {
    fn analyse(&self, mutants: Vec<MutationDetails>) -> Vec<MutationResult> {
        let mut totals: BTreeMap<DetectionStatus, usize> = BTreeMap::new();
        let results: Vec<MutationResult> = mutants
            .into_iter()
            .map(|details| {
                let result = match self.history.previous_result(&details.id) {
                    Some(previous) => self.analyse_from_history(details, previous),
                    None => not_started(details),
                };
                *totals.entry(result.status()).or_default() += 1;
                result
            })
            .collect();

        for (status, count) in &totals {
            debug!(%status, count, "incremental analysis classified mutants");
        }
        let reused: usize = totals
            .iter()
            .filter(|(status, _)| **status != DetectionStatus::NotStarted)
            .map(|(_, count)| count)
            .sum();
        info!(reused, total = results.len(), "incremental analysis reduced mutations to run");
        results
    }
}
