//! Projects described by a `mutascope.toml` manifest.
//!
//! The manifest lists code units, the shell commands that test them and the
//! mutants a generator produced for them:
//!
//! ```toml
//! [harness]
//! activate = "./switch-mutant.sh"
//!
//! [[units]]
//! name = "calc.Adder"
//! source = "src/adder.sh"
//! lines = [3, 4]
//!
//! [[tests]]
//! name = "adds_small_numbers"
//! command = "./test_adder.sh"
//! defining_unit = "calc.AdderTest"
//!
//! [[mutants]]
//! unit = "calc.Adder"
//! method = "add"
//! index = 0
//! operator = "MATH"
//! line = 3
//! description = "replaced + with -"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execute::{CommandHarness, TestSpec};
use crate::model::{CodeSource, CodeUnit, CodeUnitData, CodeUnitName, ContentHash};
use crate::mutation::{MutationDetails, MutationGenerator, MutationIdentifier};

/// Manifest file name inside a project directory.
pub const MANIFEST_FILE: &str = "mutascope.toml";

/// Errors loading a project's code model.
#[derive(Debug, Error)]
pub enum CodeModelError {
    /// IO failure.
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Manifest parse failure.
    #[error("invalid manifest: {0}")]
    Toml(#[from] toml::de::Error),
    /// An entry names a unit the manifest does not declare.
    #[error("{entry} refers to unknown unit `{unit}`")]
    UnknownUnit { entry: String, unit: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitEntry {
    pub name: CodeUnitName,
    /// File whose bytes are hashed, relative to the project.
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub lines: Vec<u32>,
    #[serde(default)]
    pub super_unit: Option<CodeUnitName>,
    #[serde(default)]
    pub outer_unit: Option<CodeUnitName>,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_interface: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub defining_unit: Option<CodeUnitName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutantEntry {
    pub unit: CodeUnitName,
    pub method: String,
    pub index: u32,
    pub operator: String,
    pub line: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub block: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessEntry {
    /// Run with the mutant id in the environment before its tests; a
    /// non-zero exit marks the mutant non-viable.
    #[serde(default)]
    pub activate: Option<String>,
}

/// Parsed `mutascope.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub harness: HarnessEntry,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
    #[serde(default)]
    pub tests: Vec<TestEntry>,
    #[serde(default)]
    pub mutants: Vec<MutantEntry>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, CodeModelError> {
        let manifest: Self = toml::from_str(text)?;
        manifest.check_references()?;
        Ok(manifest)
    }

    fn check_references(&self) -> Result<(), CodeModelError> {
        let known: std::collections::BTreeSet<&CodeUnitName> =
            self.units.iter().map(|u| &u.name).collect();
        let unknown = |entry: String, unit: &CodeUnitName| CodeModelError::UnknownUnit {
            entry,
            unit: unit.to_string(),
        };

        for mutant in &self.mutants {
            if !known.contains(&mutant.unit) {
                return Err(unknown(
                    format!("mutant {}#{}", mutant.method, mutant.index),
                    &mutant.unit,
                ));
            }
        }
        for unit in &self.units {
            for parent in unit.super_unit.iter().chain(&unit.outer_unit) {
                if !known.contains(parent) {
                    return Err(unknown(format!("unit {}", unit.name), parent));
                }
            }
        }
        Ok(())
    }
}

/// A project directory and its manifest.
#[derive(Debug, Clone)]
pub struct Project {
    dir: PathBuf,
    manifest: Manifest,
}

impl Project {
    /// Load `mutascope.toml` from `dir`.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CodeModelError> {
        let dir = dir.into();
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|source| CodeModelError::Io { path, source })?;
        Ok(Self {
            dir,
            manifest: Manifest::parse(&text)?,
        })
    }

    pub fn new(dir: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self {
            dir: dir.into(),
            manifest,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn code_source(&self) -> Arc<ManifestCodeSource> {
        Arc::new(ManifestCodeSource::new(&self.dir, &self.manifest.units))
    }

    pub fn mutator(&self) -> Arc<ManifestMutator> {
        Arc::new(ManifestMutator::new(self.manifest.mutants.clone()))
    }

    /// Tests in manifest order.
    pub fn tests(&self) -> Vec<TestSpec> {
        self.manifest
            .tests
            .iter()
            .map(|entry| {
                let spec = TestSpec::new(entry.name.clone(), entry.command.clone());
                match &entry.defining_unit {
                    Some(unit) => spec.with_defining_unit(unit.clone()),
                    None => spec,
                }
            })
            .collect()
    }

    pub fn harness(&self) -> CommandHarness {
        CommandHarness::new(&self.dir).with_activate_command(self.manifest.harness.activate.clone())
    }
}

/// [`CodeSource`] over manifest units, hashing their source files.
#[derive(Debug)]
pub struct ManifestCodeSource {
    dir: PathBuf,
    units: BTreeMap<CodeUnitName, UnitEntry>,
}

impl ManifestCodeSource {
    pub fn new(dir: impl Into<PathBuf>, units: &[UnitEntry]) -> Self {
        Self {
            dir: dir.into(),
            units: units.iter().map(|u| (u.name.clone(), u.clone())).collect(),
        }
    }

    /// SHA-256 of the source file, or of the name and line table when the
    /// unit has no readable file.
    fn content_hash(&self, entry: &UnitEntry) -> ContentHash {
        let bytes = entry
            .source
            .as_ref()
            .and_then(|source| std::fs::read(self.dir.join(source)).ok());
        match bytes {
            Some(bytes) => ContentHash::of(&bytes),
            None => {
                tracing::debug!(unit = %entry.name, "no source file, hashing line table");
                ContentHash::of(format!("{}:{:?}", entry.name, entry.lines).as_bytes())
            }
        }
    }
}

impl CodeSource for ManifestCodeSource {
    fn fetch(&self, name: &CodeUnitName) -> Option<CodeUnitData> {
        let entry = self.units.get(name)?;
        Some(CodeUnitData {
            name: entry.name.clone(),
            lines: entry.lines.iter().copied().collect(),
            super_unit: entry.super_unit.clone(),
            outer_unit: entry.outer_unit.clone(),
            is_abstract: entry.is_abstract,
            is_interface: entry.is_interface,
            content_hash: self.content_hash(entry),
        })
    }

    fn unit_names(&self) -> Vec<CodeUnitName> {
        self.units.keys().cloned().collect()
    }
}

/// [`MutationGenerator`] replaying the manifest's mutants.
#[derive(Debug, Clone, Default)]
pub struct ManifestMutator {
    mutants: Vec<MutantEntry>,
}

impl ManifestMutator {
    pub fn new(mutants: Vec<MutantEntry>) -> Self {
        Self { mutants }
    }
}

impl MutationGenerator for ManifestMutator {
    fn generate(&self, unit: &CodeUnit, operators: &[String]) -> Vec<MutationDetails> {
        self.mutants
            .iter()
            .filter(|m| &m.unit == unit.name())
            .filter(|m| operators.is_empty() || operators.iter().any(|op| op == &m.operator))
            .map(|m| {
                let mut details = MutationDetails::new(
                    MutationIdentifier::new(m.unit.clone(), m.method.clone(), m.index, m.operator.clone()),
                    m.line,
                    m.description.clone(),
                );
                details.block = m.block;
                details
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::model::CodeRepository;

    const MANIFEST: &str = r#"
[harness]
activate = "true"

[[units]]
name = "calc.Base"
lines = [1]

[[units]]
name = "calc.Adder"
source = "adder.sh"
lines = [3, 4]
super_unit = "calc.Base"

[[tests]]
name = "adds"
command = "true"
defining_unit = "calc.Adder"

[[tests]]
name = "loose"
command = "false"

[[mutants]]
unit = "calc.Adder"
method = "add"
index = 0
operator = "MATH"
line = 3
description = "replaced + with -"

[[mutants]]
unit = "calc.Adder"
method = "add"
index = 1
operator = "RETURN"
line = 4
block = 2
"#;

    fn project() -> (tempfile::TempDir, Project) {
        let tmp = tempdir().expect("tempdir should be created");
        std::fs::write(tmp.path().join(MANIFEST_FILE), MANIFEST).expect("manifest should be written");
        std::fs::write(tmp.path().join("adder.sh"), "echo $((1 + 2))\n").expect("source should be written");
        let project = Project::load(tmp.path()).expect("project should load");
        (tmp, project)
    }

    #[test]
    fn manifest_loads_units_tests_and_mutants() {
        let (_tmp, project) = project();
        assert_eq!(project.manifest().units.len(), 2);
        assert_eq!(project.manifest().harness.activate.as_deref(), Some("true"));

        let tests = project.tests();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].defining_unit, Some(CodeUnitName::new("calc.Adder")));
        assert_eq!(tests[1].defining_unit, None);
    }

    #[test]
    fn source_file_edits_change_the_content_hash() {
        let (tmp, project) = project();
        let name = CodeUnitName::new("calc.Adder");

        let before = CodeRepository::new(project.code_source())
            .fetch(&name)
            .expect("unit should resolve");
        assert!(before.is_code_line(3));
        assert_eq!(before.super_unit(), Some(&CodeUnitName::new("calc.Base")));

        std::fs::write(tmp.path().join("adder.sh"), "echo $((1 - 2))\n").expect("source should be rewritten");
        let after = CodeRepository::new(project.code_source())
            .fetch(&name)
            .expect("unit should resolve");
        assert_ne!(before.content_hash(), after.content_hash());

        let base = CodeRepository::new(project.code_source())
            .fetch(&CodeUnitName::new("calc.Base"))
            .expect("unit without source should still resolve");
        assert_eq!(base.number_of_code_lines(), 1);
    }

    #[test]
    fn mutator_filters_by_unit_and_operator() {
        let (_tmp, project) = project();
        let repo = CodeRepository::new(project.code_source());
        let adder = repo.fetch(&CodeUnitName::new("calc.Adder")).expect("unit should resolve");
        let base = repo.fetch(&CodeUnitName::new("calc.Base")).expect("unit should resolve");
        let mutator = project.mutator();

        assert_eq!(mutator.generate(&adder, &[]).len(), 2);
        let only_math = mutator.generate(&adder, &["MATH".to_string()]);
        assert_eq!(only_math.len(), 1);
        assert_eq!(only_math[0].description, "replaced + with -");
        assert_eq!(mutator.generate(&adder, &["RETURN".to_string()])[0].block, Some(2));
        assert!(mutator.generate(&base, &[]).is_empty());
    }

    #[test]
    fn unknown_units_and_missing_manifests_are_errors() {
        let bad = "[[mutants]]\nunit = \"nope.Gone\"\nmethod = \"m\"\nindex = 0\noperator = \"OP\"\nline = 1\n";
        assert!(matches!(
            Manifest::parse(bad),
            Err(CodeModelError::UnknownUnit { .. })
        ));

        let tmp = tempdir().expect("tempdir should be created");
        assert!(matches!(
            Project::load(tmp.path()),
            Err(CodeModelError::Io { .. })
        ));
    }
}
