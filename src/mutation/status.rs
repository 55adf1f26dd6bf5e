//! Detection statuses, per-mutant verdicts and the per-unit status map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::details::{MutationDetails, MutationIdentifier};
use crate::model::CodeUnitName;

/// Outcome of analysing one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionStatus {
    /// Queued, never handed to a worker.
    NotStarted,
    /// Handed to a worker, no verdict yet.
    Started,
    /// A covering test failed with the mutant active.
    Killed,
    /// Every covering test passed with the mutant active.
    Survived,
    /// The worker exceeded its deadline.
    TimedOut,
    /// The mutant could not be activated.
    NonViable,
    /// The worker ran out of memory.
    MemoryError,
    /// The worker failed for any other reason.
    RunError,
    /// No test covers the mutant.
    NoCoverage,
}

impl DetectionStatus {
    /// Every status, in declaration order.
    pub const ALL: [DetectionStatus; 9] = [
        Self::NotStarted,
        Self::Started,
        Self::Killed,
        Self::Survived,
        Self::TimedOut,
        Self::NonViable,
        Self::MemoryError,
        Self::RunError,
        Self::NoCoverage,
    ];

    /// Statuses that count towards the mutation score.
    pub fn is_detected(self) -> bool {
        matches!(
            self,
            Self::Killed | Self::TimedOut | Self::MemoryError | Self::RunError
        )
    }

    /// False only for `NotStarted` and `Started`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Started)
    }

    /// Stable upper-case name used in reports and history.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Started => "STARTED",
            Self::Killed => "KILLED",
            Self::Survived => "SURVIVED",
            Self::TimedOut => "TIMED_OUT",
            Self::NonViable => "NON_VIABLE",
            Self::MemoryError => "MEMORY_ERROR",
            Self::RunError => "RUN_ERROR",
            Self::NoCoverage => "NO_COVERAGE",
        }
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status plus the tests that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTestPair {
    /// Number of test executions performed for the mutant.
    pub tests_run: u32,
    /// Final status.
    pub status: DetectionStatus,
    /// Tests that failed with the mutant active.
    pub killing_tests: Vec<String>,
    /// Tests that passed with the mutant active. Only populated in full-matrix mode.
    pub succeeding_tests: Vec<String>,
    /// Tests that timed out.
    pub timed_out_tests: Vec<String>,
    /// Tests that crashed the worker.
    pub run_error_tests: Vec<String>,
    /// Tests that exhausted worker memory.
    pub memory_error_tests: Vec<String>,
}

impl StatusTestPair {
    /// A verdict reached without naming any test.
    pub fn not_analysed(tests_run: u32, status: DetectionStatus) -> Self {
        Self {
            tests_run,
            status,
            killing_tests: Vec::new(),
            succeeding_tests: Vec::new(),
            timed_out_tests: Vec::new(),
            run_error_tests: Vec::new(),
            memory_error_tests: Vec::new(),
        }
    }

    /// Killed by a single test.
    pub fn killed_by(tests_run: u32, test: impl Into<String>) -> Self {
        let mut pair = Self::not_analysed(tests_run, DetectionStatus::Killed);
        pair.killing_tests.push(test.into());
        pair
    }

    /// First killing test, if any.
    pub fn killing_test(&self) -> Option<&str> {
        self.killing_tests.first().map(String::as_str)
    }

    /// Fold one test's verdict into a full-matrix result.
    ///
    /// Precedence is `KILLED > RUN_ERROR > MEMORY_ERROR > TIMED_OUT > SURVIVED`.
    pub fn accumulate(&mut self, other: &StatusTestPair, test: &str) {
        self.tests_run += other.tests_run;

        match other.status {
            DetectionStatus::Killed => {
                push_unique(&mut self.killing_tests, test);
                self.succeeding_tests.retain(|t| t != test);
            }
            DetectionStatus::Survived => {
                if !self.killing_tests.iter().any(|t| t == test) {
                    push_unique(&mut self.succeeding_tests, test);
                }
            }
            DetectionStatus::MemoryError => {
                push_unique(&mut self.memory_error_tests, test);
                self.succeeding_tests.retain(|t| t != test);
            }
            DetectionStatus::RunError => {
                push_unique(&mut self.run_error_tests, test);
                self.succeeding_tests.retain(|t| t != test);
            }
            DetectionStatus::TimedOut => {
                push_unique(&mut self.timed_out_tests, test);
                self.succeeding_tests.retain(|t| t != test);
            }
            _ => {}
        }

        self.status = if !self.killing_tests.is_empty() {
            DetectionStatus::Killed
        } else if !self.run_error_tests.is_empty() {
            DetectionStatus::RunError
        } else if !self.memory_error_tests.is_empty() {
            DetectionStatus::MemoryError
        } else if !self.timed_out_tests.is_empty() {
            DetectionStatus::TimedOut
        } else if !self.succeeding_tests.is_empty() {
            DetectionStatus::Survived
        } else {
            other.status
        };
    }
}

fn push_unique(list: &mut Vec<String>, test: &str) {
    if !list.iter().any(|t| t == test) {
        list.push(test.to_string());
    }
}

impl fmt::Display for StatusTestPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.killing_tests.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} by {}", self.status, self.killing_tests.join(", "))
        }
    }
}

/// Final verdict for one mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    /// The mutant.
    pub details: MutationDetails,
    /// Its verdict.
    pub pair: StatusTestPair,
}

impl MutationResult {
    pub fn new(details: MutationDetails, pair: StatusTestPair) -> Self {
        Self { details, pair }
    }

    pub fn status(&self) -> DetectionStatus {
        self.pair.status
    }

    pub fn id(&self) -> &MutationIdentifier {
        &self.details.id
    }
}

/// Results for mutants of a single code unit, as handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassMutationResults {
    /// Results, all for the same unit.
    pub results: Vec<MutationResult>,
}

impl ClassMutationResults {
    pub fn new(results: Vec<MutationResult>) -> Self {
        Self { results }
    }

    /// Unit the results belong to; `None` when empty.
    pub fn unit(&self) -> Option<&CodeUnitName> {
        self.results.first().map(|r| r.details.unit())
    }

    /// Package of the unit; empty when there are no results.
    pub fn package(&self) -> &str {
        self.unit().map(CodeUnitName::package).unwrap_or("")
    }
}

/// Per-unit map from mutant to its current verdict.
///
/// Owned by the task driving one analysis unit. Mutants start as
/// `NOT_STARTED` and only move forward.
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    entries: BTreeMap<MutationIdentifier, (MutationDetails, StatusTestPair)>,
}

impl StatusMap {
    /// Every mutant `NOT_STARTED`.
    pub fn new(mutants: impl IntoIterator<Item = MutationDetails>) -> Self {
        let mut map = Self::default();
        map.set_status_for_mutations(mutants, DetectionStatus::NotStarted);
        map
    }

    /// Force every given mutant to `status`.
    pub fn set_status_for_mutations(
        &mut self,
        mutants: impl IntoIterator<Item = MutationDetails>,
        status: DetectionStatus,
    ) {
        for details in mutants {
            self.entries.insert(
                details.id.clone(),
                (details, StatusTestPair::not_analysed(0, status)),
            );
        }
    }

    /// Mark a `NOT_STARTED` mutant as `STARTED`.
    pub fn mark_started(&mut self, id: &MutationIdentifier) {
        if let Some((_, pair)) = self.entries.get_mut(id) {
            if pair.status == DetectionStatus::NotStarted {
                pair.status = DetectionStatus::Started;
            }
        }
    }

    /// Record a verdict unless one is already recorded. Returns true when the
    /// verdict was accepted.
    pub fn resolve(&mut self, id: &MutationIdentifier, verdict: StatusTestPair) -> bool {
        match self.entries.get_mut(id) {
            Some((_, pair)) if !pair.status.is_terminal() && verdict.status.is_terminal() => {
                *pair = verdict;
                true
            }
            _ => false,
        }
    }

    /// Mark every uncovered `NOT_STARTED` mutant `NO_COVERAGE` and return them.
    pub fn mark_uncovered(&mut self) -> Vec<MutationIdentifier> {
        let mut marked = Vec::new();
        for (id, (details, pair)) in &mut self.entries {
            if pair.status == DetectionStatus::NotStarted && !details.is_covered() {
                *pair = StatusTestPair::not_analysed(0, DetectionStatus::NoCoverage);
                marked.push(id.clone());
            }
        }
        marked
    }

    pub fn has_unrun(&self) -> bool {
        self.entries
            .values()
            .any(|(_, pair)| pair.status == DetectionStatus::NotStarted)
    }

    /// `NOT_STARTED` mutants in identifier order.
    pub fn unrun(&self) -> Vec<MutationDetails> {
        self.with_status(DetectionStatus::NotStarted)
    }

    /// `STARTED` mutants in identifier order.
    pub fn unfinished(&self) -> Vec<MutationDetails> {
        self.with_status(DetectionStatus::Started)
    }

    fn with_status(&self, status: DetectionStatus) -> Vec<MutationDetails> {
        self.entries
            .values()
            .filter(|(_, pair)| pair.status == status)
            .map(|(details, _)| details.clone())
            .collect()
    }

    /// Current verdict for one mutant.
    pub fn get(&self, id: &MutationIdentifier) -> Option<&StatusTestPair> {
        self.entries.get(id).map(|(_, pair)| pair)
    }

    /// Result for one mutant, if present.
    pub fn result(&self, id: &MutationIdentifier) -> Option<MutationResult> {
        self.entries
            .get(id)
            .map(|(details, pair)| MutationResult::new(details.clone(), pair.clone()))
    }

    /// All results in identifier order.
    pub fn into_results(self) -> Vec<MutationResult> {
        self.entries
            .into_values()
            .map(|(details, pair)| MutationResult::new(details, pair))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::TestInfo;

    fn details(index: u32, tests: &[&str]) -> MutationDetails {
        MutationDetails::new(MutationIdentifier::new("a.A", "m", index, "OP"), index, "d")
            .with_tests(tests.iter().map(|t| TestInfo::new(*t, 1)).collect())
    }

    fn single(status: DetectionStatus) -> StatusTestPair {
        StatusTestPair::not_analysed(1, status)
    }

    #[test]
    fn detected_statuses_match_score_definition() {
        let detected: Vec<DetectionStatus> = DetectionStatus::ALL
            .into_iter()
            .filter(|s| s.is_detected())
            .collect();
        assert_eq!(
            detected,
            vec![
                DetectionStatus::Killed,
                DetectionStatus::TimedOut,
                DetectionStatus::MemoryError,
                DetectionStatus::RunError
            ]
        );
        assert!(!DetectionStatus::Started.is_terminal());
        assert!(DetectionStatus::NoCoverage.is_terminal());
    }

    #[test]
    fn status_serializes_as_upper_snake_case() {
        let json = serde_json::to_string(&DetectionStatus::TimedOut).expect("status should serialize");
        assert_eq!(json, "\"TIMED_OUT\"");
    }

    #[test]
    fn accumulate_follows_precedence() {
        let mut pair = StatusTestPair::not_analysed(0, DetectionStatus::Survived);
        pair.accumulate(&single(DetectionStatus::Survived), "t1");
        assert_eq!(pair.status, DetectionStatus::Survived);

        pair.accumulate(&single(DetectionStatus::TimedOut), "t2");
        assert_eq!(pair.status, DetectionStatus::TimedOut);

        pair.accumulate(&single(DetectionStatus::MemoryError), "t3");
        assert_eq!(pair.status, DetectionStatus::MemoryError);

        pair.accumulate(&single(DetectionStatus::RunError), "t4");
        assert_eq!(pair.status, DetectionStatus::RunError);

        pair.accumulate(&single(DetectionStatus::Killed), "t5");
        assert_eq!(pair.status, DetectionStatus::Killed);
        assert_eq!(pair.tests_run, 5);
        assert_eq!(pair.killing_test(), Some("t5"));
        assert_eq!(pair.succeeding_tests, vec!["t1".to_string()]);
    }

    #[test]
    fn killed_test_leaves_succeeding_list() {
        let mut pair = StatusTestPair::not_analysed(0, DetectionStatus::Survived);
        pair.accumulate(&single(DetectionStatus::Survived), "t1");
        pair.accumulate(&single(DetectionStatus::Killed), "t1");
        assert!(pair.succeeding_tests.is_empty());
        assert_eq!(pair.killing_tests, vec!["t1".to_string()]);
    }

    #[test]
    fn status_map_resolves_first_terminal_verdict_only() {
        let mut map = StatusMap::new(vec![details(0, &["t"]), details(1, &["t"])]);
        let id0 = MutationIdentifier::new("a.A", "m", 0, "OP");

        map.mark_started(&id0);
        assert_eq!(map.unfinished().len(), 1);
        assert!(map.resolve(&id0, StatusTestPair::killed_by(1, "t")));
        assert!(!map.resolve(&id0, single(DetectionStatus::Survived)));
        assert_eq!(map.get(&id0).map(|p| p.status), Some(DetectionStatus::Killed));
        assert!(!map.resolve(
            &MutationIdentifier::new("a.A", "m", 1, "OP"),
            single(DetectionStatus::Started)
        ));
        assert!(map.has_unrun());
    }

    #[test]
    fn uncovered_mutants_are_marked_without_running() {
        let mut map = StatusMap::new(vec![details(0, &[]), details(1, &["t"])]);
        let marked = map.mark_uncovered();
        assert_eq!(marked, vec![MutationIdentifier::new("a.A", "m", 0, "OP")]);
        assert_eq!(map.unrun().len(), 1);
        let statuses: Vec<DetectionStatus> =
            map.into_results().iter().map(MutationResult::status).collect();
        assert_eq!(
            statuses,
            vec![DetectionStatus::NoCoverage, DetectionStatus::NotStarted]
        );
    }
}
