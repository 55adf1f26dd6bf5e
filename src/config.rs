//! Mutation run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::{ExcludedLinesFilter, GroupingStrategy, PrioritiserStrategy};
use crate::execute::{ExecutionSettings, TimeoutPolicy};
use crate::report::ReportFormat;
use crate::stats::ThresholdChecker;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse failure.
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    /// A value out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Resolved options for a mutation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    /// Directory holding `mutascope.toml`; tests run here.
    pub project_dir: PathBuf,
    /// Worker processes running mutants at once.
    pub threads: usize,
    pub timeout_factor: f32,
    pub timeout_constant_ms: u64,
    /// Expected worst-case time of one baseline test. The timeout policy
    /// applied to it bounds every test of the coverage run.
    pub coverage_test_budget_ms: u64,
    pub history_input: Option<PathBuf>,
    pub history_output: Option<PathBuf>,
    /// Run every covering test against every mutant.
    pub full_mutation_matrix: bool,
    /// Minimum mutation score in percent; 0 disables.
    pub mutation_threshold: u32,
    /// Minimum line coverage in percent; 0 disables.
    pub coverage_threshold: u32,
    /// Maximum surviving mutants; 0 disables.
    pub max_surviving: u64,
    /// Mutants per analysis unit; 0 means no limit.
    pub mutation_unit_size: usize,
    pub grouping: GroupingStrategy,
    pub prioritiser: PrioritiserStrategy,
    pub fail_when_no_mutations: bool,
    pub output_formats: Vec<ReportFormat>,
    pub report_dir: PathBuf,
    /// Operators to apply; empty applies all.
    pub operators: Vec<String>,
    pub excluded_operators: Vec<String>,
    /// `unit:line` pairs never mutated.
    pub excluded_lines: Vec<String>,
    /// Unit name globs to mutate; empty mutates everything.
    pub target_units: Vec<String>,
    /// Drop mutants covered by fewer tests than this; 0 disables.
    pub min_covering_tests: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        let defaults = TimeoutPolicy::default();
        Self {
            project_dir: PathBuf::from("."),
            threads: 1,
            timeout_factor: defaults.factor,
            timeout_constant_ms: u64::try_from(defaults.constant.as_millis()).unwrap_or(u64::MAX),
            coverage_test_budget_ms: 60_000,
            history_input: None,
            history_output: None,
            full_mutation_matrix: false,
            mutation_threshold: 0,
            coverage_threshold: 0,
            max_surviving: 0,
            mutation_unit_size: 0,
            grouping: GroupingStrategy::default(),
            prioritiser: PrioritiserStrategy::default(),
            fail_when_no_mutations: true,
            output_formats: vec![ReportFormat::Json],
            report_dir: PathBuf::from("target/mutascope"),
            operators: Vec::new(),
            excluded_operators: Vec::new(),
            excluded_lines: Vec::new(),
            target_units: Vec::new(),
            min_covering_tests: 0,
        }
    }
}

impl MutationConfig {
    /// Read a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validated()
    }

    /// Clamp and check values.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.threads = self.threads.max(1);
        if !self.timeout_factor.is_finite() || self.timeout_factor < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout_factor must be a non-negative number, got {}",
                self.timeout_factor
            )));
        }
        for (name, value) in [
            ("mutation_threshold", self.mutation_threshold),
            ("coverage_threshold", self.coverage_threshold),
        ] {
            if value > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{name} is a percentage, got {value}"
                )));
            }
        }
        if let Some(entry) = self
            .excluded_lines
            .iter()
            .find(|entry| ExcludedLinesFilter::parse_entry(entry).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "excluded_lines entries must look like `unit:line`, got `{entry}`"
            )));
        }
        Ok(self)
    }

    /// `path` resolved against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(self.timeout_factor, self.timeout_constant_ms)
    }

    /// Longest a single baseline test may run before coverage is abandoned.
    pub fn coverage_timeout(&self) -> Duration {
        self.timeout_policy().timeout_for(self.coverage_test_budget_ms)
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            threads: self.threads.max(1),
            full_matrix: self.full_mutation_matrix,
            timeout: self.timeout_policy(),
        }
    }

    pub fn threshold_checker(&self) -> ThresholdChecker {
        ThresholdChecker {
            mutation_threshold: self.mutation_threshold,
            coverage_threshold: self.coverage_threshold,
            max_surviving: self.max_surviving,
        }
    }

    pub fn with_project_dir(mut self, project_dir: impl Into<PathBuf>) -> Self {
        self.project_dir = project_dir.into();
        self
    }

    /// Set worker count, never below one.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_timeout_factor(mut self, factor: f32) -> Self {
        self.timeout_factor = factor;
        self
    }

    pub fn with_timeout_constant_ms(mut self, constant_ms: u64) -> Self {
        self.timeout_constant_ms = constant_ms;
        self
    }

    pub fn with_coverage_test_budget_ms(mut self, budget_ms: u64) -> Self {
        self.coverage_test_budget_ms = budget_ms;
        self
    }

    pub fn with_history_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_input = Some(path.into());
        self
    }

    pub fn with_history_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_output = Some(path.into());
        self
    }

    pub fn with_full_mutation_matrix(mut self, enabled: bool) -> Self {
        self.full_mutation_matrix = enabled;
        self
    }

    pub fn with_mutation_threshold(mut self, percent: u32) -> Self {
        self.mutation_threshold = percent;
        self
    }

    pub fn with_coverage_threshold(mut self, percent: u32) -> Self {
        self.coverage_threshold = percent;
        self
    }

    pub fn with_max_surviving(mut self, max: u64) -> Self {
        self.max_surviving = max;
        self
    }

    pub fn with_mutation_unit_size(mut self, size: usize) -> Self {
        self.mutation_unit_size = size;
        self
    }

    pub fn with_grouping(mut self, grouping: GroupingStrategy) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_prioritiser(mut self, prioritiser: PrioritiserStrategy) -> Self {
        self.prioritiser = prioritiser;
        self
    }

    pub fn with_fail_when_no_mutations(mut self, fail: bool) -> Self {
        self.fail_when_no_mutations = fail;
        self
    }

    pub fn with_output_formats(mut self, formats: Vec<ReportFormat>) -> Self {
        self.output_formats = formats;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    pub fn with_operators(mut self, operators: Vec<String>) -> Self {
        self.operators = operators;
        self
    }

    pub fn with_excluded_operators(mut self, operators: Vec<String>) -> Self {
        self.excluded_operators = operators;
        self
    }

    pub fn with_excluded_lines(mut self, lines: Vec<String>) -> Self {
        self.excluded_lines = lines;
        self
    }

    pub fn with_target_units(mut self, globs: Vec<String>) -> Self {
        self.target_units = globs;
        self
    }

    pub fn with_min_covering_tests(mut self, min: usize) -> Self {
        self.min_covering_tests = min;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MutationConfig::default();
        assert_eq!(config.threads, 1);
        assert_eq!(config.timeout_factor, 1.25);
        assert_eq!(config.timeout_constant_ms, 4000);
        assert_eq!(config.mutation_unit_size, 0);
        assert!(config.fail_when_no_mutations);
        assert!(!config.full_mutation_matrix);
        assert_eq!(config.threshold_checker(), ThresholdChecker::default());
        assert_eq!(config.coverage_timeout(), Duration::from_millis(79_000));
    }

    #[test]
    fn coverage_timeout_follows_the_timeout_policy() {
        let config = MutationConfig::default()
            .with_timeout_factor(2.0)
            .with_timeout_constant_ms(500)
            .with_coverage_test_budget_ms(1_000);
        assert_eq!(config.coverage_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn builder_overrides_work() {
        let config = MutationConfig::default()
            .with_project_dir("/tmp/project-a")
            .with_threads(0)
            .with_timeout_factor(2.0)
            .with_timeout_constant_ms(10)
            .with_history_input("in.jsonl")
            .with_history_output("/abs/out.jsonl")
            .with_full_mutation_matrix(true)
            .with_grouping(GroupingStrategy::PerCodeUnit)
            .with_output_formats(vec![ReportFormat::Markdown]);

        assert_eq!(config.threads, 1);
        assert_eq!(
            config.timeout_policy().timeout_for(100),
            Duration::from_millis(210)
        );
        assert_eq!(
            config.resolve(config.history_input.as_deref().expect("input should be set")),
            PathBuf::from("/tmp/project-a/in.jsonl")
        );
        assert_eq!(
            config.resolve(config.history_output.as_deref().expect("output should be set")),
            PathBuf::from("/abs/out.jsonl")
        );
        assert!(config.execution_settings().full_matrix);
    }

    #[test]
    fn load_reads_toml_and_keeps_defaults_for_missing_keys() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let path = tmp.path().join("mutascope-config.toml");
        std::fs::write(
            &path,
            r#"
threads = 0
timeout_factor = 3.0
grouping = "per-code-unit"
output_formats = ["json", "md"]
target_units = ["com.example.*"]
"#,
        )
        .expect("config should be written");

        let config = MutationConfig::load(&path).expect("config should load");
        assert_eq!(config.threads, 1);
        assert_eq!(config.timeout_factor, 3.0);
        assert_eq!(config.timeout_constant_ms, 4000);
        assert_eq!(config.grouping, GroupingStrategy::PerCodeUnit);
        assert_eq!(
            config.output_formats,
            vec![ReportFormat::Json, ReportFormat::Markdown]
        );
        assert_eq!(config.target_units, vec!["com.example.*".to_string()]);
    }

    #[test]
    fn load_rejects_bad_values() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let path = tmp.path().join("bad.toml");

        std::fs::write(&path, "mutation_threshold = 140\n").expect("config should be written");
        assert!(matches!(
            MutationConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "excluded_lines = [\"a.A:3\", \"a.A\"]\n").expect("config should be written");
        match MutationConfig::load(&path) {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("`a.A`"), "{message}"),
            other => panic!("malformed excluded line should be rejected, got {other:?}"),
        }

        std::fs::write(&path, "no_such_option = true\n").expect("config should be written");
        assert!(matches!(MutationConfig::load(&path), Err(ConfigError::Toml(_))));
    }
}
