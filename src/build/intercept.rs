//! Interceptors that filter or rewrite the mutant list before grouping.

use std::collections::{BTreeSet, HashSet};

use crate::model::CodeUnitName;
use crate::mutation::MutationDetails;

/// Interceptor kinds, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterceptorType {
    Other,
    Modify,
    Filter,
    ModifyCosmetic,
    Report,
}

/// Rewrites the list of candidate mutants.
pub trait MutationInterceptor: Send + Sync {
    fn kind(&self) -> InterceptorType;

    /// Whether the interceptor can run before coverage is known.
    fn safe_for_prescan(&self) -> bool {
        true
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails>;
}

/// Runs a set of interceptors in type order, registration order within a type.
pub struct CompoundInterceptor {
    children: Vec<Box<dyn MutationInterceptor>>,
}

impl CompoundInterceptor {
    pub fn new(mut children: Vec<Box<dyn MutationInterceptor>>) -> Self {
        children.sort_by_key(|child| child.kind());
        Self { children }
    }

    /// Every interceptor.
    pub fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        self.children
            .iter()
            .fold(mutants, |mutants, child| child.intercept(mutants))
    }

    /// Only the interceptors that do not need coverage.
    pub fn prescan(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        self.children
            .iter()
            .filter(|child| child.safe_for_prescan())
            .fold(mutants, |mutants, child| child.intercept(mutants))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Drops mutants on configured `unit:line` pairs.
pub struct ExcludedLinesFilter {
    lines: HashSet<(CodeUnitName, u32)>,
}

impl ExcludedLinesFilter {
    pub fn new(lines: impl IntoIterator<Item = (CodeUnitName, u32)>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
        }
    }

    /// One `unit:line` entry, or `None` if it is malformed.
    pub fn parse_entry(entry: &str) -> Option<(CodeUnitName, u32)> {
        let (unit, line) = entry.rsplit_once(':')?;
        let unit = unit.trim();
        if unit.is_empty() {
            return None;
        }
        Some((CodeUnitName::new(unit), line.trim().parse().ok()?))
    }

    /// Parse `unit:line` entries. Config validation rejects malformed
    /// entries, so any that reach here are skipped.
    pub fn parse<'a>(entries: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(entries.into_iter().filter_map(Self::parse_entry))
    }
}

impl MutationInterceptor for ExcludedLinesFilter {
    fn kind(&self) -> InterceptorType {
        InterceptorType::Filter
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        mutants
            .into_iter()
            .filter(|m| !self.lines.contains(&(m.unit().clone(), m.line)))
            .collect()
    }
}

/// Drops mutants produced by excluded operators.
pub struct ExcludedOperatorsFilter {
    operators: BTreeSet<String>,
}

impl ExcludedOperatorsFilter {
    pub fn new(operators: impl IntoIterator<Item = String>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
        }
    }
}

impl MutationInterceptor for ExcludedOperatorsFilter {
    fn kind(&self) -> InterceptorType {
        InterceptorType::Filter
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        mutants
            .into_iter()
            .filter(|m| !self.operators.contains(m.operator()))
            .collect()
    }
}

/// Keeps the first of any mutants sharing an identifier.
pub struct DuplicateMutantFilter;

impl MutationInterceptor for DuplicateMutantFilter {
    fn kind(&self) -> InterceptorType {
        InterceptorType::Filter
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        let mut seen = HashSet::new();
        mutants
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect()
    }
}

/// Keeps mutants whose unit matches one of the configured globs.
pub struct TargetUnitsFilter {
    globs: Vec<String>,
}

impl TargetUnitsFilter {
    pub fn new(globs: impl IntoIterator<Item = String>) -> Self {
        Self {
            globs: globs.into_iter().collect(),
        }
    }

    pub fn matches(&self, unit: &CodeUnitName) -> bool {
        self.globs.is_empty()
            || self
                .globs
                .iter()
                .any(|glob| glob_match::glob_match(glob, unit.as_str()))
    }
}

impl MutationInterceptor for TargetUnitsFilter {
    fn kind(&self) -> InterceptorType {
        InterceptorType::Other
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        mutants.into_iter().filter(|m| self.matches(m.unit())).collect()
    }
}

/// Drops mutants covered by fewer than `min_tests` tests.
pub struct QuorumFilter {
    min_tests: usize,
}

impl QuorumFilter {
    pub fn new(min_tests: usize) -> Self {
        Self { min_tests }
    }
}

impl MutationInterceptor for QuorumFilter {
    fn kind(&self) -> InterceptorType {
        InterceptorType::Filter
    }

    fn safe_for_prescan(&self) -> bool {
        false
    }

    fn intercept(&self, mutants: Vec<MutationDetails>) -> Vec<MutationDetails> {
        mutants
            .into_iter()
            .filter(|m| m.tests_in_order.len() >= self.min_tests)
            .collect()
    }
}
