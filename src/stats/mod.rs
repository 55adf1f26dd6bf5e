//! Mutation scores, coverage totals and threshold checks.

mod listener;

use std::collections::BTreeMap;

use serde::Serialize;

pub use listener::{
    CompoundListener, HistoryListener, ListenerResult, MutationResultListener, ProgressListener,
    StatisticsListener,
};

use crate::coverage::CoverageSummary;
use crate::mutation::{ClassMutationResults, DetectionStatus, MutationResult};

/// `part` as a whole percentage of `total`, rounded half-up.
///
/// Nothing to measure counts as 100%.
pub fn percentage(part: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    let rounded = (part.saturating_mul(100) + total / 2) / total;
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

/// Verdict counts for one mutation operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Score {
    pub operator: String,
    pub counts: BTreeMap<DetectionStatus, u64>,
    /// Tests executed across this operator's mutants.
    pub tests_run: u64,
}

impl Score {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            ..Self::default()
        }
    }

    fn register(&mut self, result: &MutationResult) {
        *self.counts.entry(result.status()).or_default() += 1;
        self.tests_run += u64::from(result.pair.tests_run);
    }

    pub fn count(&self, status: DetectionStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total_mutations(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Mutants the tests noticed: killed, timed out, memory or run error.
    pub fn total_detected(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(status, _)| status.is_detected())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn percentage_detected(&self) -> u32 {
        percentage(self.total_detected(), self.total_mutations())
    }

    /// Killed as a share of killed plus survived.
    pub fn mutation_score(&self) -> u32 {
        let killed = self.count(DetectionStatus::Killed);
        percentage(killed, killed + self.count(DetectionStatus::Survived))
    }
}

/// Whole-run mutation totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationStatistics {
    /// Scores by operator name.
    pub scores: BTreeMap<String, Score>,
    pub total_mutations: u64,
    pub total_detected: u64,
    pub total_survived: u64,
    pub tests_run: u64,
}

impl MutationStatistics {
    pub fn percentage_detected(&self) -> u32 {
        percentage(self.total_detected, self.total_mutations)
    }

    /// Killed as a share of killed plus survived. Mutants with any other
    /// verdict are left out of both sides.
    pub fn mutation_score(&self) -> u32 {
        let killed = self.count(DetectionStatus::Killed);
        percentage(killed, killed + self.total_survived)
    }

    /// Average tests executed per mutant.
    pub fn tests_per_mutation(&self) -> f64 {
        if self.total_mutations == 0 {
            0.0
        } else {
            self.tests_run as f64 / self.total_mutations as f64
        }
    }

    pub fn count(&self, status: DetectionStatus) -> u64 {
        self.scores.values().map(|score| score.count(status)).sum()
    }
}

/// Folds class results into per-operator scores.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    scores: BTreeMap<String, Score>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_results(&mut self, results: &ClassMutationResults) {
        for result in &results.results {
            let operator = result.details.operator();
            self.scores
                .entry(operator.to_string())
                .or_insert_with(|| Score::new(operator))
                .register(result);
        }
    }

    pub fn to_statistics(&self) -> MutationStatistics {
        let mut stats = MutationStatistics {
            scores: self.scores.clone(),
            ..MutationStatistics::default()
        };
        for score in self.scores.values() {
            stats.total_mutations += score.total_mutations();
            stats.total_detected += score.total_detected();
            stats.total_survived += score.count(DetectionStatus::Survived);
            stats.tests_run += score.tests_run;
        }
        stats
    }
}

/// Everything a run hands back to its caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedStatistics {
    pub mutation_statistics: MutationStatistics,
    /// Line coverage of the mutated units only.
    pub coverage_summary: CoverageSummary,
    /// Problems noticed while verifying the build, such as an empty run.
    pub issues: Vec<String>,
}

/// Pass marks for a finished run. Zero disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdChecker {
    pub mutation_threshold: u32,
    pub coverage_threshold: u32,
    pub max_surviving: u64,
}

impl ThresholdChecker {
    /// Human-readable description of every failed check.
    pub fn violations(&self, stats: &CombinedStatistics) -> Vec<String> {
        let mut violations = Vec::new();
        let mutation = &stats.mutation_statistics;

        let score = mutation.mutation_score();
        if self.mutation_threshold > 0 && score < self.mutation_threshold {
            violations.push(format!(
                "mutation score of {score}% is below threshold of {}%",
                self.mutation_threshold
            ));
        }
        let coverage = stats.coverage_summary.coverage_percent();
        if self.coverage_threshold > 0 && coverage < self.coverage_threshold {
            violations.push(format!(
                "line coverage of {coverage}% is below threshold of {}%",
                self.coverage_threshold
            ));
        }
        if self.max_surviving > 0 && mutation.total_survived > self.max_surviving {
            violations.push(format!(
                "had {} surviving mutants, but only {} survivors allowed",
                mutation.total_survived, self.max_surviving
            ));
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::mutation::{MutationDetails, MutationIdentifier, StatusTestPair};

    fn result(operator: &str, index: u32, status: DetectionStatus) -> MutationResult {
        MutationResult::new(
            MutationDetails::new(MutationIdentifier::new("a.A", "m", index, operator), 1, "d"),
            StatusTestPair::not_analysed(1, status),
        )
    }

    fn stats(statuses: &[DetectionStatus]) -> MutationStatistics {
        let mut aggregator = StatisticsAggregator::new();
        aggregator.register_results(&ClassMutationResults::new(
            statuses
                .iter()
                .enumerate()
                .map(|(i, status)| result("OP", i as u32, *status))
                .collect(),
        ));
        aggregator.to_statistics()
    }

    #[test]
    fn percentage_follows_scoring_rules() {
        assert_eq!(percentage(0, 0), 100);
        assert_eq!(percentage(7, 10), 70);
        assert_eq!(percentage(3, 4), 75);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(1, 8), 13);
    }

    #[test]
    fn detected_statuses_count_towards_the_score() {
        let stats = stats(&[
            DetectionStatus::Killed,
            DetectionStatus::TimedOut,
            DetectionStatus::MemoryError,
            DetectionStatus::RunError,
            DetectionStatus::Survived,
            DetectionStatus::NoCoverage,
            DetectionStatus::NonViable,
            DetectionStatus::Survived,
        ]);
        assert_eq!(stats.total_mutations, 8);
        assert_eq!(stats.total_detected, 4);
        assert_eq!(stats.total_survived, 2);
        assert_eq!(stats.percentage_detected(), 50);
        assert_eq!(stats.mutation_score(), 33);
        assert_eq!(stats.tests_run, 8);
        assert!((stats.tests_per_mutation() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn scores_are_split_by_operator() {
        let mut aggregator = StatisticsAggregator::new();
        aggregator.register_results(&ClassMutationResults::new(vec![
            result("NEGATE", 0, DetectionStatus::Killed),
            result("NEGATE", 1, DetectionStatus::Survived),
            result("RETURN", 2, DetectionStatus::Killed),
        ]));
        let stats = aggregator.to_statistics();
        assert_eq!(stats.scores["NEGATE"].percentage_detected(), 50);
        assert_eq!(stats.scores["RETURN"].percentage_detected(), 100);
        assert_eq!(stats.count(DetectionStatus::Killed), 2);
    }

    #[test]
    fn mutation_score_ignores_undecided_verdicts() {
        let stats = stats(&[
            DetectionStatus::Killed,
            DetectionStatus::Killed,
            DetectionStatus::Killed,
            DetectionStatus::Survived,
            DetectionStatus::NoCoverage,
            DetectionStatus::RunError,
        ]);
        assert_eq!(stats.mutation_score(), 75);
        assert_eq!(stats.percentage_detected(), 67);

        let only_timeouts = self::stats(&[DetectionStatus::TimedOut]);
        assert_eq!(only_timeouts.mutation_score(), 100);

        let mut ten = vec![DetectionStatus::Killed; 7];
        ten.extend([DetectionStatus::Survived; 3]);
        assert_eq!(self::stats(&ten).mutation_score(), 70);
    }

    #[test]
    fn empty_run_scores_full_marks() {
        let stats = stats(&[]);
        assert_eq!(stats.percentage_detected(), 100);
        assert_eq!(stats.mutation_score(), 100);
        assert_eq!(stats.tests_per_mutation(), 0.0);
    }

    #[test]
    fn threshold_checker_reports_each_failed_check() {
        let combined = CombinedStatistics {
            mutation_statistics: stats(&[
                DetectionStatus::Killed,
                DetectionStatus::Survived,
                DetectionStatus::Survived,
            ]),
            coverage_summary: CoverageSummary {
                total_lines: 4,
                covered_lines: 1,
            },
            issues: Vec::new(),
        };

        assert!(ThresholdChecker::default().violations(&combined).is_empty());

        let checker = ThresholdChecker {
            mutation_threshold: 50,
            coverage_threshold: 30,
            max_surviving: 1,
        };
        let violations = checker.violations(&combined);
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("33%"));
        assert!(violations[1].contains("25%"));
        assert!(violations[2].contains("2 surviving"));
    }

    proptest! {
        #[test]
        fn percentage_stays_in_range(total in 1u64..10_000, part_ratio in 0.0f64..=1.0) {
            let part = (total as f64 * part_ratio).floor() as u64;
            let pct = percentage(part, total);
            prop_assert!(pct <= 100);
            prop_assert_eq!(percentage(total, total), 100);
            prop_assert_eq!(percentage(0, total), 0);
        }
    }
}
