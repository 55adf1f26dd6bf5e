use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mutascope::config::MutationConfig;
use mutascope::execute::{SelfExecLauncher, run_minion};
use mutascope::pipeline::{MutationCoverage, check_thresholds};
use mutascope::project::Project;
use mutascope::report::ReportFormat;
use mutascope::stats::{CombinedStatistics, ProgressListener};

#[derive(Debug, Parser)]
#[command(name = "cargo-mutascope")]
#[command(about = "Mutation testing for shell-described projects")]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Measure coverage, analyse every mutant and report.
    Run(RunArgs),
    /// Analyse one unit of mutants for a parent engine.
    #[command(hide = true)]
    Minion(MinionArgs),
    /// Measure coverage for a parent engine.
    #[command(hide = true)]
    CoverageMinion(MinionArgs),
}

#[derive(Debug, Args)]
struct MinionArgs {
    #[arg(long)]
    port: u16,
    #[arg(long)]
    project: PathBuf,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Project directory holding `mutascope.toml`.
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// TOML file with run options; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    timeout_factor: Option<f32>,
    /// Milliseconds added to every unit deadline.
    #[arg(long)]
    timeout_const: Option<u64>,
    #[arg(long)]
    history_input: Option<PathBuf>,
    #[arg(long)]
    history_output: Option<PathBuf>,
    /// Run every covering test against every mutant.
    #[arg(long)]
    full_matrix: bool,
    /// Mutants per analysis unit; 0 means no limit.
    #[arg(long)]
    unit_size: Option<usize>,
    #[arg(long)]
    mutation_threshold: Option<u32>,
    #[arg(long)]
    coverage_threshold: Option<u32>,
    #[arg(long)]
    max_surviving: Option<u64>,
    /// Report format; repeat for several.
    #[arg(long, value_enum)]
    format: Vec<OutputFormat>,
    #[arg(long)]
    report_dir: Option<PathBuf>,
    /// Warn instead of failing when there is nothing to mutate.
    #[arg(long)]
    no_fail_on_empty: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Md => ReportFormat::Markdown,
            OutputFormat::Json => ReportFormat::Json,
        }
    }
}

fn make_config(args: &RunArgs) -> Result<MutationConfig> {
    let mut config = match &args.config {
        Some(path) => MutationConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MutationConfig::default(),
    };
    config = config.with_project_dir(&args.project);
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    if let Some(factor) = args.timeout_factor {
        config = config.with_timeout_factor(factor);
    }
    if let Some(constant) = args.timeout_const {
        config = config.with_timeout_constant_ms(constant);
    }
    if let Some(path) = &args.history_input {
        config = config.with_history_input(path);
    }
    if let Some(path) = &args.history_output {
        config = config.with_history_output(path);
    }
    if args.full_matrix {
        config = config.with_full_mutation_matrix(true);
    }
    if let Some(size) = args.unit_size {
        config = config.with_mutation_unit_size(size);
    }
    if let Some(threshold) = args.mutation_threshold {
        config = config.with_mutation_threshold(threshold);
    }
    if let Some(threshold) = args.coverage_threshold {
        config = config.with_coverage_threshold(threshold);
    }
    if let Some(max) = args.max_surviving {
        config = config.with_max_surviving(max);
    }
    if !args.format.is_empty() {
        config = config.with_output_formats(args.format.iter().copied().map(Into::into).collect());
    }
    if let Some(dir) = &args.report_dir {
        config = config.with_report_dir(dir);
    }
    if args.no_fail_on_empty {
        config = config.with_fail_when_no_mutations(false);
    }
    Ok(config.validated()?)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_summary(stats: &CombinedStatistics) {
    let mutation = &stats.mutation_statistics;
    println!(
        ">> Generated {} mutations Killed {} ({}%)",
        mutation.total_mutations,
        mutation.total_detected,
        mutation.percentage_detected()
    );
    println!(
        ">> Ran {} tests ({:.2} tests per mutation)",
        mutation.tests_run,
        mutation.tests_per_mutation()
    );
    println!(
        ">> Line Coverage (for mutated units only): {}/{} ({}%)",
        stats.coverage_summary.covered_lines,
        stats.coverage_summary.total_lines,
        stats.coverage_summary.coverage_percent()
    );
    for score in mutation.scores.values() {
        println!(
            "> {}: Generated {} Killed {} ({}%)",
            score.operator,
            score.total_mutations(),
            score.total_detected(),
            score.percentage_detected()
        );
    }
    for issue in &stats.issues {
        println!("mutascope: {issue}");
    }
}

fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let config = make_config(&args)?;
    let project = Project::load(&config.project_dir)?;
    let launcher = Arc::new(SelfExecLauncher::current(project.dir())?.with_verbose(verbose));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("mutascope: interrupt received, stopping minions");
        let _ = shutdown_tx.send(true);
    })
    .context("failed to install Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let stats = runtime.block_on(
        MutationCoverage::for_project(&project, config.clone(), launcher)
            .with_shutdown(shutdown_rx)
            .with_listener(Box::new(ProgressListener::stderr()))
            .run_report(),
    )?;
    print_summary(&stats);
    check_thresholds(&config, &stats)?;
    Ok(())
}

fn serve_minion(args: MinionArgs) -> ! {
    let code = match Project::load(&args.project) {
        Ok(project) => run_minion(args.port, &project.harness()),
        Err(err) => {
            tracing::error!(%err, "minion could not load project");
            mutascope::execute::ExitCode::TestPluginIssue
        }
    };
    std::process::exit(code.code())
}

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("mutascope") {
        args.remove(1);
    }
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args, cli.verbose),
        Command::Minion(args) | Command::CoverageMinion(args) => serve_minion(args),
    }
}
