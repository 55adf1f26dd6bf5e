//! History of previous runs, used to skip work whose outcome cannot have
//! changed.
//!
//! The store is a JSON Lines file. Each line is one record: a unit's hashes,
//! a green test's coverage, or a mutant's verdict. Unreadable lines are
//! skipped and counted; a missing file means a cold start.

mod incremental;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use incremental::{CodeHistory, IncrementalAnalyser};

use crate::coverage::{CoverageData, CoverageResult, ProbeHit};
use crate::execute::TestSpec;
use crate::model::{CodeRepository, CodeUnitName, ContentHash};
use crate::mutation::{
    DetectionStatus, MutationIdentifier, MutationResult, StatusTestPair, TestInfo,
};

/// History persistence errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded.
    #[error("history encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    /// The finished file could not be moved into place.
    #[error("could not replace history file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Hashes of a unit as of a previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitHistory {
    pub name: CodeUnitName,
    pub content_hash: ContentHash,
    pub hierarchical_hash: ContentHash,
    /// `None` when nothing covered the unit.
    pub coverage_id: Option<ContentHash>,
}

/// Coverage of a green test as of a previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHistory {
    pub name: String,
    pub execution_time_ms: u64,
    pub defining_unit: Option<CodeUnitName>,
    pub visited: Vec<ProbeHit>,
}

/// Verdict for a mutant as of a previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHistory {
    pub id: MutationIdentifier,
    #[serde(flatten)]
    pub pair: StatusTestPair,
}

/// One line of the history file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Unit(UnitHistory),
    Test(TestHistory),
    Result(ResultHistory),
}

/// What was read from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    pub units: HashMap<CodeUnitName, UnitHistory>,
    pub tests: HashMap<String, TestHistory>,
    pub results: HashMap<MutationIdentifier, StatusTestPair>,
    /// Lines that could not be parsed.
    pub malformed_lines: usize,
}

/// Tests split by whether coverage must be measured again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitedTests {
    /// Tests to run under coverage.
    pub to_run: Vec<TestSpec>,
    /// Recorded coverage standing in for skipped tests.
    pub replayed: Vec<CoverageResult>,
}

/// Statuses that can be carried forward without re-running.
fn is_reusable(status: DetectionStatus) -> bool {
    matches!(
        status,
        DetectionStatus::Killed | DetectionStatus::TimedOut | DetectionStatus::Survived
    )
}

/// Read side and write side of a run's history.
pub trait HistoryStore: Send {
    /// Load the previous run. Never fails: unreadable history is a cold start.
    fn initialize(&mut self) -> &HistorySnapshot;

    /// The previous run, as loaded by [`HistoryStore::initialize`].
    fn previous(&self) -> &HistorySnapshot;

    /// Snapshot unit hashes, coverage ids and green-test coverage for the
    /// next run.
    fn process_coverage(
        &mut self,
        coverage: &CoverageData,
        repo: &CodeRepository,
        units: &[CodeUnitName],
    );

    /// Remember a verdict for the next run.
    fn record_result(&mut self, result: &MutationResult);

    /// Write everything recorded.
    fn close(&mut self) -> Result<(), HistoryError>;

    /// Drop tests whose coverage cannot have changed since the previous run
    /// and replay their recorded coverage instead.
    ///
    /// A test is dropped only when its defining unit is known and unchanged,
    /// it was green last time, every unit it reached is unchanged, and every
    /// recorded verdict in those units is reusable.
    fn limit_tests(&self, tests: Vec<TestSpec>, repo: &CodeRepository) -> LimitedTests {
        let previous = self.previous();
        let history = CodeHistory::new(repo, &previous.units, &previous.results);

        let mut settled: BTreeMap<&CodeUnitName, bool> = BTreeMap::new();
        for (id, pair) in &previous.results {
            let entry = settled.entry(&id.unit).or_insert(true);
            *entry &= is_reusable(pair.status);
        }

        let mut limited = LimitedTests::default();
        for test in tests {
            let Some(defining) = test.defining_unit.as_ref() else {
                limited.to_run.push(test);
                continue;
            };
            let Some(recorded) = previous.tests.get(&test.name) else {
                limited.to_run.push(test);
                continue;
            };
            let reached: BTreeSet<&CodeUnitName> =
                recorded.visited.iter().map(|hit| &hit.unit).collect();
            let skippable = recorded.defining_unit.as_ref() == Some(defining)
                && !history.has_unit_changed(defining)
                && reached.iter().all(|unit| {
                    !history.has_unit_changed(unit) && settled.get(unit).copied().unwrap_or(true)
                });

            if skippable {
                debug!(test = %test.name, "replaying recorded coverage");
                limited.replayed.push(CoverageResult {
                    test: TestInfo {
                        name: recorded.name.clone(),
                        execution_time_ms: recorded.execution_time_ms,
                        defining_unit: recorded.defining_unit.clone(),
                        probes_hit: 0,
                    },
                    passed: true,
                    visited: recorded.visited.clone(),
                });
            } else {
                limited.to_run.push(test);
            }
        }
        if !limited.replayed.is_empty() {
            info!(
                skipped = limited.replayed.len(),
                running = limited.to_run.len(),
                "history limited the tests needing coverage"
            );
        }
        limited
    }
}

/// JSON Lines history file.
///
/// Reads from `input` and writes to `output`; either may be absent.
#[derive(Debug, Default)]
pub struct FileHistoryStore {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    previous: HistorySnapshot,
    units: BTreeMap<CodeUnitName, UnitHistory>,
    tests: BTreeMap<String, TestHistory>,
    results: BTreeMap<MutationIdentifier, StatusTestPair>,
}

impl FileHistoryStore {
    pub fn new(input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        Self {
            input,
            output,
            ..Self::default()
        }
    }

    /// A store that neither reads nor writes.
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Read a history file, skipping malformed lines.
pub fn read_history(path: &Path) -> Result<HistorySnapshot, HistoryError> {
    let reader = BufReader::new(File::open(path)?);
    let mut snapshot = HistorySnapshot::default();

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                snapshot.malformed_lines += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(HistoryRecord::Unit(unit)) => {
                snapshot.units.insert(unit.name.clone(), unit);
            }
            Ok(HistoryRecord::Test(test)) => {
                snapshot.tests.insert(test.name.clone(), test);
            }
            Ok(HistoryRecord::Result(result)) => {
                snapshot.results.insert(result.id, result.pair);
            }
            Err(_) => snapshot.malformed_lines += 1,
        }
    }
    Ok(snapshot)
}

/// Write records to `path` through a temporary file in the same directory.
pub fn write_history<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a HistoryRecord>,
) -> Result<(), HistoryError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    for record in records {
        serde_json::to_writer(&mut file, record)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    file.persist(path)?;
    Ok(())
}

impl HistoryStore for FileHistoryStore {
    fn initialize(&mut self) -> &HistorySnapshot {
        self.previous = match self.input.as_deref() {
            None => HistorySnapshot::default(),
            Some(path) => match read_history(path) {
                Ok(snapshot) => {
                    if snapshot.malformed_lines > 0 {
                        warn!(
                            path = %path.display(),
                            malformed = snapshot.malformed_lines,
                            "skipped unreadable history records"
                        );
                    }
                    info!(
                        units = snapshot.units.len(),
                        results = snapshot.results.len(),
                        "loaded history"
                    );
                    snapshot
                }
                Err(HistoryError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                    info!(path = %path.display(), "no history found, starting cold");
                    HistorySnapshot::default()
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "history unreadable, starting cold");
                    HistorySnapshot::default()
                }
            },
        };
        &self.previous
    }

    fn previous(&self) -> &HistorySnapshot {
        &self.previous
    }

    fn process_coverage(
        &mut self,
        coverage: &CoverageData,
        repo: &CodeRepository,
        units: &[CodeUnitName],
    ) {
        for name in units {
            let Some(id) = repo.hierarchical_id(name) else {
                continue;
            };
            self.units.insert(
                name.clone(),
                UnitHistory {
                    name: name.clone(),
                    content_hash: id.content_hash,
                    hierarchical_hash: id.hierarchical_hash,
                    coverage_id: coverage.coverage_id_for_unit(name, repo),
                },
            );
        }
        for result in coverage.results().filter(|r| r.passed) {
            self.tests.insert(
                result.test.name.clone(),
                TestHistory {
                    name: result.test.name.clone(),
                    execution_time_ms: result.test.execution_time_ms,
                    defining_unit: result.test.defining_unit.clone(),
                    visited: result.visited.clone(),
                },
            );
        }
    }

    fn record_result(&mut self, result: &MutationResult) {
        self.results.insert(result.id().clone(), result.pair.clone());
    }

    fn close(&mut self) -> Result<(), HistoryError> {
        let Some(path) = self.output.as_deref() else {
            return Ok(());
        };
        let records: Vec<HistoryRecord> = self
            .units
            .values()
            .cloned()
            .map(HistoryRecord::Unit)
            .chain(self.tests.values().cloned().map(HistoryRecord::Test))
            .chain(self.results.iter().map(|(id, pair)| {
                HistoryRecord::Result(ResultHistory {
                    id: id.clone(),
                    pair: pair.clone(),
                })
            }))
            .collect();
        write_history(path, &records)?;
        info!(path = %path.display(), records = records.len(), "wrote history");
        Ok(())
    }
}
