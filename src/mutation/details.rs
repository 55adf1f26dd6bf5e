//! Mutant identity and per-mutant metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::CodeUnitName;

/// Stable identity of one mutant.
///
/// Ordering is by unit, then method, then index, then operator. That order
/// fixes the sequence mutants are grouped and dispatched in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationIdentifier {
    /// Code unit the mutant lives in.
    pub unit: CodeUnitName,
    /// Method or function within the unit.
    pub method: String,
    /// Index of the mutated instruction within the method.
    pub index: u32,
    /// Operator that produced the mutant.
    pub operator: String,
}

impl MutationIdentifier {
    /// Build an identifier.
    pub fn new(
        unit: impl Into<CodeUnitName>,
        method: impl Into<String>,
        index: u32,
        operator: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            method: method.into(),
            index,
            operator: operator.into(),
        }
    }
}

impl fmt::Display for MutationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.unit, self.method, self.index, self.operator
        )
    }
}

/// A test as seen by coverage and prioritisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestInfo {
    /// Unique test name.
    pub name: String,
    /// Expected execution time measured during coverage.
    pub execution_time_ms: u64,
    /// Unit whose source defines the test, if known.
    pub defining_unit: Option<CodeUnitName>,
    /// Number of distinct probes the test visited.
    pub probes_hit: u32,
}

impl TestInfo {
    /// Build test info with no coverage measured yet.
    pub fn new(name: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            name: name.into(),
            execution_time_ms,
            defining_unit: None,
            probes_hit: 0,
        }
    }

    /// Set the defining unit.
    pub fn with_defining_unit(mut self, unit: impl Into<CodeUnitName>) -> Self {
        self.defining_unit = Some(unit.into());
        self
    }
}

/// Everything known about a mutant before it is analysed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationDetails {
    /// Mutant identity.
    pub id: MutationIdentifier,
    /// Source line the mutant changes.
    pub line: u32,
    /// Basic block the mutant changes, when the generator tracks blocks.
    pub block: Option<u32>,
    /// Human-readable description of the change.
    pub description: String,
    /// Covering tests in the order they should be run.
    pub tests_in_order: Vec<TestInfo>,
}

impl MutationDetails {
    /// Build details with no tests attached.
    pub fn new(id: MutationIdentifier, line: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            line,
            block: None,
            description: description.into(),
            tests_in_order: Vec::new(),
        }
    }

    /// Replace the covering tests.
    pub fn with_tests(mut self, tests: Vec<TestInfo>) -> Self {
        self.tests_in_order = tests;
        self
    }

    pub fn unit(&self) -> &CodeUnitName {
        &self.id.unit
    }

    pub fn operator(&self) -> &str {
        &self.id.operator
    }

    /// True when at least one test covers the mutant.
    pub fn is_covered(&self) -> bool {
        !self.tests_in_order.is_empty()
    }

    /// Sum of the expected execution time of the covering tests.
    pub fn expected_time_ms(&self) -> u64 {
        self.tests_in_order
            .iter()
            .map(|t| t.execution_time_ms)
            .sum()
    }

    /// Move the named test to the front of the run order, if present.
    pub fn prioritise_test(&mut self, name: &str) {
        if let Some(pos) = self.tests_in_order.iter().position(|t| t.name == name) {
            let test = self.tests_in_order.remove(pos);
            self.tests_in_order.insert(0, test);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_order_by_unit_method_index_operator() {
        let mut ids = vec![
            MutationIdentifier::new("b.B", "run", 0, "NEGATE"),
            MutationIdentifier::new("a.A", "run", 2, "NEGATE"),
            MutationIdentifier::new("a.A", "run", 1, "VOID"),
            MutationIdentifier::new("a.A", "run", 1, "MATH"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "a.A#run#1#MATH",
                "a.A#run#1#VOID",
                "a.A#run#2#NEGATE",
                "b.B#run#0#NEGATE"
            ]
        );
    }

    #[test]
    fn prioritise_test_moves_named_test_first() {
        let mut details = MutationDetails::new(MutationIdentifier::new("a.A", "m", 0, "OP"), 3, "d")
            .with_tests(vec![
                TestInfo::new("fast", 1),
                TestInfo::new("mid", 5),
                TestInfo::new("slow", 9),
            ]);
        details.prioritise_test("slow");
        let names: Vec<&str> = details.tests_in_order.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast", "mid"]);
        assert_eq!(details.expected_time_ms(), 15);

        details.prioritise_test("absent");
        assert_eq!(details.tests_in_order[0].name, "slow");
    }
}
