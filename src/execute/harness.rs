//! Test harness contract and the shell-command implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::model::CodeUnitName;
use crate::mutation::{MutationIdentifier, TestInfo};

/// Environment variable carrying the active mutant's id.
pub const ACTIVE_MUTANT_ENV: &str = "MUTASCOPE_ACTIVE_MUTANT";
/// Environment variable naming the file probe visits are appended to.
pub const PROBE_FILE_ENV: &str = "MUTASCOPE_PROBE_FILE";

/// A runnable test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestSpec {
    /// Unique test name.
    pub name: String,
    /// Shell command running the test.
    pub command: String,
    /// Unit whose source defines the test.
    pub defining_unit: Option<CodeUnitName>,
}

impl TestSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            defining_unit: None,
        }
    }

    pub fn with_defining_unit(mut self, unit: impl Into<CodeUnitName>) -> Self {
        self.defining_unit = Some(unit.into());
        self
    }
}

/// Outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Test passed.
    Passed,
    /// Test failed or could not be run.
    Failed {
        /// Short failure description.
        message: String,
    },
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Runs tests, optionally with a mutant switched on.
pub trait TestHarness: Send + Sync {
    /// Switch `mutant` on, or restore unmutated code with `None`. An `Err`
    /// means the mutant cannot be made to run.
    fn activate(&self, mutant: Option<&MutationIdentifier>) -> Result<(), String>;

    /// Run one test. When `probe_file` is set the test records probe visits
    /// there.
    fn execute(&self, test: &TestSpec, probe_file: Option<&Path>) -> TestOutcome;
}

/// Runs each test as `sh -c <command>` inside the project directory.
///
/// The active mutant is exposed through [`ACTIVE_MUTANT_ENV`]. An optional
/// activation command runs on every switch; a non-zero exit marks the mutant
/// non-viable.
#[derive(Debug)]
pub struct CommandHarness {
    project_dir: PathBuf,
    activate_command: Option<String>,
    active: Mutex<Option<String>>,
}

impl CommandHarness {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            activate_command: None,
            active: Mutex::new(None),
        }
    }

    /// Command run on every mutant switch.
    pub fn with_activate_command(mut self, command: Option<String>) -> Self {
        self.activate_command = command;
        self
    }

    fn shell(&self, script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .env_remove(PROBE_FILE_ENV);
        match self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
        {
            Some(id) => command.env(ACTIVE_MUTANT_ENV, id),
            None => command.env_remove(ACTIVE_MUTANT_ENV),
        };
        command
    }
}

impl TestHarness for CommandHarness {
    fn activate(&self, mutant: Option<&MutationIdentifier>) -> Result<(), String> {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) =
            mutant.map(ToString::to_string);

        let (Some(_), Some(script)) = (mutant, self.activate_command.as_deref()) else {
            return Ok(());
        };
        let output = self
            .shell(script)
            .output()
            .map_err(|err| format!("activation command failed to start: {err}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(first_line(&output.stderr)
                .unwrap_or_else(|| format!("activation command exited with {}", output.status)))
        }
    }

    fn execute(&self, test: &TestSpec, probe_file: Option<&Path>) -> TestOutcome {
        let mut command = self.shell(&test.command);
        if let Some(path) = probe_file {
            command.env(PROBE_FILE_ENV, path);
        }
        match command.output() {
            Ok(output) if output.status.success() => TestOutcome::Passed,
            Ok(output) => TestOutcome::Failed {
                message: first_line(&output.stderr)
                    .unwrap_or_else(|| format!("test exited with {}", output.status)),
            },
            Err(err) => TestOutcome::Failed {
                message: format!("test failed to start: {err}"),
            },
        }
    }
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

/// Lookup from test name to runnable test.
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    tests: BTreeMap<String, TestSpec>,
}

impl TestCatalog {
    pub fn new(tests: impl IntoIterator<Item = TestSpec>) -> Self {
        Self {
            tests: tests.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TestSpec> {
        self.tests.get(name)
    }

    /// Runnable tests for `infos`, preserving order. Unknown names are skipped.
    pub fn resolve(&self, infos: &[TestInfo]) -> Vec<TestSpec> {
        infos
            .iter()
            .filter_map(|info| {
                let spec = self.tests.get(&info.name);
                if spec.is_none() {
                    tracing::warn!(test = %info.name, "covering test missing from catalog");
                }
                spec.cloned()
            })
            .collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &TestSpec> {
        self.tests.values()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn command_harness_exposes_active_mutant() {
        let tmp = tempdir().expect("tempdir should be created");
        let harness = CommandHarness::new(tmp.path());
        let test = TestSpec::new("t", r#"[ -z "$MUTASCOPE_ACTIVE_MUTANT" ]"#);

        assert!(harness.execute(&test, None).passed());

        let id = MutationIdentifier::new("a.A", "m", 0, "OP");
        harness.activate(Some(&id)).expect("activation should succeed");
        assert!(!harness.execute(&test, None).passed());

        harness.activate(None).expect("deactivation should succeed");
        assert!(harness.execute(&test, None).passed());
    }

    #[test]
    fn command_harness_writes_probes_to_the_given_file() {
        let tmp = tempdir().expect("tempdir should be created");
        let probes = tmp.path().join("probes");
        let harness = CommandHarness::new(tmp.path());
        let test = TestSpec::new("t", r#"echo "a.A:3" >> "$MUTASCOPE_PROBE_FILE""#);

        assert!(harness.execute(&test, Some(&probes)).passed());
        let written = std::fs::read_to_string(&probes).expect("probe file should exist");
        assert_eq!(written.trim(), "a.A:3");
    }

    #[test]
    fn failing_activation_reports_reason() {
        let tmp = tempdir().expect("tempdir should be created");
        let harness = CommandHarness::new(tmp.path())
            .with_activate_command(Some("echo 'does not compile' >&2; exit 1".to_string()));
        let id = MutationIdentifier::new("a.A", "m", 0, "OP");

        let err = harness
            .activate(Some(&id))
            .expect_err("activation should fail");
        assert_eq!(err, "does not compile");
        harness
            .activate(None)
            .expect("restoring unmutated code should not run the activation command");
    }

    #[test]
    fn catalog_resolves_in_order_and_skips_unknown() {
        let catalog = TestCatalog::new(vec![TestSpec::new("a", "true"), TestSpec::new("b", "true")]);
        let resolved = catalog.resolve(&[
            TestInfo::new("b", 1),
            TestInfo::new("ghost", 1),
            TestInfo::new("a", 1),
        ]);
        let names: Vec<&str> = resolved.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
