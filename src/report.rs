//! Markdown and JSON mutation reports.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::mutation::{ClassMutationResults, DetectionStatus, MutationResult};
use crate::stats::{ListenerResult, MutationResultListener, MutationStatistics, StatisticsAggregator};

/// Supported output formats for run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// `mutations.json`, every mutant inline.
    Json,
    /// `mutations.md` summary.
    #[serde(alias = "md")]
    Markdown,
}

impl ReportFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Json => "mutations.json",
            Self::Markdown => "mutations.md",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "md" | "markdown" => Ok(Self::Markdown),
            other => Err(format!("unknown report format `{other}` (expected json or md)")),
        }
    }
}

/// Per-mutant report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutantReport {
    pub id: String,
    pub unit: String,
    pub method: String,
    pub operator: String,
    pub line: u32,
    pub block: Option<u32>,
    pub description: String,
    pub status: DetectionStatus,
    pub tests_run: u32,
    pub killing_tests: Vec<String>,
    pub succeeding_tests: Vec<String>,
    pub timed_out_tests: Vec<String>,
    pub run_error_tests: Vec<String>,
    pub memory_error_tests: Vec<String>,
}

impl From<&MutationResult> for MutantReport {
    fn from(result: &MutationResult) -> Self {
        let id = &result.details.id;
        Self {
            id: id.to_string(),
            unit: id.unit.to_string(),
            method: id.method.clone(),
            operator: id.operator.clone(),
            line: result.details.line,
            block: result.details.block,
            description: result.details.description.clone(),
            status: result.status(),
            tests_run: result.pair.tests_run,
            killing_tests: result.pair.killing_tests.clone(),
            succeeding_tests: result.pair.succeeding_tests.clone(),
            timed_out_tests: result.pair.timed_out_tests.clone(),
            run_error_tests: result.pair.run_error_tests.clone(),
            memory_error_tests: result.pair.memory_error_tests.clone(),
        }
    }
}

/// Aggregated run counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: u64,
    /// Killed as a whole percentage of killed plus survived.
    pub mutation_score: u32,
    pub killed: u64,
    pub survived: u64,
    pub timed_out: u64,
    pub no_coverage: u64,
    pub non_viable: u64,
    pub memory_error: u64,
    pub run_error: u64,
    pub tests_run: u64,
}

impl RunSummary {
    pub fn from_statistics(stats: &MutationStatistics) -> Self {
        Self {
            total: stats.total_mutations,
            mutation_score: stats.mutation_score(),
            killed: stats.count(DetectionStatus::Killed),
            survived: stats.count(DetectionStatus::Survived),
            timed_out: stats.count(DetectionStatus::TimedOut),
            no_coverage: stats.count(DetectionStatus::NoCoverage),
            non_viable: stats.count(DetectionStatus::NonViable),
            memory_error: stats.count(DetectionStatus::MemoryError),
            run_error: stats.count(DetectionStatus::RunError),
            tests_run: stats.tests_run,
        }
    }
}

/// Render a report for `results` in `format`.
pub fn render_report(
    results: &[MutationResult],
    stats: &MutationStatistics,
    format: ReportFormat,
) -> Result<String, serde_json::Error> {
    let summary = RunSummary::from_statistics(stats);
    let mut mutants: Vec<MutantReport> = results.iter().map(MutantReport::from).collect();
    mutants.sort_by(|a, b| a.id.cmp(&b.id));

    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "operators": stats.scores.values().map(|score| serde_json::json!({
                "operator": score.operator,
                "total": score.total_mutations(),
                "detected": score.total_detected(),
                "score": score.percentage_detected(),
            })).collect::<Vec<_>>(),
            "mutants": mutants,
        })),
        ReportFormat::Markdown => Ok(render_markdown(&summary, stats, &mutants)),
    }
}

fn render_markdown(summary: &RunSummary, stats: &MutationStatistics, mutants: &[MutantReport]) -> String {
    let mut out = String::from("# Mutation Report\n\n");

    out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
    for (label, value) in [
        ("total", summary.total),
        ("killed", summary.killed),
        ("survived", summary.survived),
        ("timed out", summary.timed_out),
        ("no coverage", summary.no_coverage),
        ("non viable", summary.non_viable),
        ("memory error", summary.memory_error),
        ("run error", summary.run_error),
        ("tests run", summary.tests_run),
    ] {
        out.push_str(&format!("| {label} | {value} |\n"));
    }
    out.push_str(&format!("| mutation score | {}% |\n", summary.mutation_score));

    if !stats.scores.is_empty() {
        out.push_str("\n## Operators\n\n| operator | mutants | detected | score |\n|---|---:|---:|---:|\n");
        for score in stats.scores.values() {
            out.push_str(&format!(
                "| {} | {} | {} | {}% |\n",
                score.operator,
                score.total_mutations(),
                score.total_detected(),
                score.percentage_detected()
            ));
        }
    }

    let survivors: Vec<&MutantReport> = mutants
        .iter()
        .filter(|m| matches!(m.status, DetectionStatus::Survived | DetectionStatus::NoCoverage))
        .collect();
    if !survivors.is_empty() {
        out.push_str("\n## Undetected Mutants\n\n");
        for m in survivors {
            out.push_str(&format!("### {}\n\n", m.id));
            out.push_str(&format!("- **description**: {}\n", m.description));
            out.push_str(&format!("- **location**: {}:{}\n", m.unit, m.line));
            out.push_str(&format!("- **status**: {}\n", m.status));
            if !m.succeeding_tests.is_empty() {
                out.push_str(&format!("- **passing tests**: {}\n", m.succeeding_tests.join(", ")));
            }
            out.push('\n');
        }
    }
    out
}

/// Collects results and writes one report per configured format on run end.
pub struct ReportListener {
    report_dir: PathBuf,
    formats: Vec<ReportFormat>,
    results: Vec<MutationResult>,
    aggregator: StatisticsAggregator,
}

impl ReportListener {
    pub fn new(report_dir: impl Into<PathBuf>, formats: Vec<ReportFormat>) -> Self {
        Self {
            report_dir: report_dir.into(),
            formats,
            results: Vec::new(),
            aggregator: StatisticsAggregator::new(),
        }
    }
}

impl MutationResultListener for ReportListener {
    fn name(&self) -> &str {
        "report"
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) -> ListenerResult {
        self.aggregator.register_results(results);
        self.results.extend(results.results.iter().cloned());
        Ok(())
    }

    fn run_end(&mut self) -> ListenerResult {
        if self.formats.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.report_dir)?;
        let stats = self.aggregator.to_statistics();
        for format in &self.formats {
            let body = render_report(&self.results, &stats, *format)?;
            let path = self.report_dir.join(format.file_name());
            std::fs::write(&path, body)?;
            tracing::info!(path = %path.display(), "wrote report");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{MutationDetails, MutationIdentifier, StatusTestPair};

    fn results() -> Vec<MutationResult> {
        vec![
            MutationResult::new(
                MutationDetails::new(MutationIdentifier::new("a.A", "run", 0, "NEGATE"), 3, "negated check"),
                StatusTestPair::killed_by(1, "a_test"),
            ),
            MutationResult::new(
                MutationDetails::new(MutationIdentifier::new("a.A", "run", 1, "RETURN"), 4, "returned zero"),
                StatusTestPair::not_analysed(2, DetectionStatus::Survived),
            ),
        ]
    }

    fn stats(results: &[MutationResult]) -> MutationStatistics {
        let mut aggregator = StatisticsAggregator::new();
        aggregator.register_results(&ClassMutationResults::new(results.to_vec()));
        aggregator.to_statistics()
    }

    #[test]
    fn formats_parse_from_cli_and_config_spellings() {
        assert_eq!("md".parse::<ReportFormat>(), Ok(ReportFormat::Markdown));
        assert_eq!("JSON".parse::<ReportFormat>(), Ok(ReportFormat::Json));
        assert!("xml".parse::<ReportFormat>().is_err());
        let from_config: ReportFormat =
            serde_json::from_str("\"md\"").expect("alias should deserialize");
        assert_eq!(from_config, ReportFormat::Markdown);
    }

    #[test]
    fn report_renders_json_and_markdown() {
        let results = results();
        let stats = stats(&results);

        let md = render_report(&results, &stats, ReportFormat::Markdown).expect("markdown should render");
        assert!(md.contains("# Mutation Report"));
        assert!(md.contains("| killed | 1 |"));
        assert!(md.contains("| mutation score | 50% |"));
        assert!(md.contains("### a.A#run#1#RETURN"));
        assert!(!md.contains("### a.A#run#0#NEGATE"));

        let json = render_report(&results, &stats, ReportFormat::Json).expect("json should render");
        let value: serde_json::Value = serde_json::from_str(&json).expect("report should be valid json");
        assert_eq!(value["summary"]["total"], 2);
        assert_eq!(value["mutants"][1]["status"], "SURVIVED");
        assert_eq!(value["operators"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn report_listener_writes_configured_formats() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let dir = tmp.path().join("reports");
        let mut listener = ReportListener::new(&dir, vec![ReportFormat::Json]);
        listener
            .handle_mutation_result(&ClassMutationResults::new(results()))
            .expect("results should be collected");
        listener.run_end().expect("report should be written");

        assert!(dir.join("mutations.json").exists());
        assert!(!dir.join("mutations.md").exists());
    }
}
