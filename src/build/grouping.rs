//! Batching mutants into analysis units.

use serde::{Deserialize, Serialize};

use crate::mutation::MutationDetails;

/// Splits a sorted mutant list into batches that share a minion.
pub trait MutationGrouper: Send + Sync {
    fn group(&self, mutants: Vec<MutationDetails>) -> Vec<Vec<MutationDetails>>;
}

/// One mutant per unit. Maximises isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerMutantGrouper;

impl MutationGrouper for PerMutantGrouper {
    fn group(&self, mutants: Vec<MutationDetails>) -> Vec<Vec<MutationDetails>> {
        mutants.into_iter().map(|m| vec![m]).collect()
    }
}

/// Batches mutants of the same code unit, at most `unit_size` per batch.
/// A size of zero puts a whole code unit in one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerCodeUnitGrouper {
    unit_size: usize,
}

impl PerCodeUnitGrouper {
    pub fn new(unit_size: usize) -> Self {
        Self { unit_size }
    }
}

impl MutationGrouper for PerCodeUnitGrouper {
    fn group(&self, mutants: Vec<MutationDetails>) -> Vec<Vec<MutationDetails>> {
        let mut groups: Vec<Vec<MutationDetails>> = Vec::new();
        for mutant in mutants {
            match groups.last_mut() {
                Some(current)
                    if current[0].unit() == mutant.unit()
                        && (self.unit_size == 0 || current.len() < self.unit_size) =>
                {
                    current.push(mutant);
                }
                _ => groups.push(vec![mutant]),
            }
        }
        groups
    }
}

/// Config-selectable grouping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingStrategy {
    /// [`PerMutantGrouper`].
    #[default]
    PerMutant,
    /// [`PerCodeUnitGrouper`].
    PerCodeUnit,
}

impl GroupingStrategy {
    pub fn grouper(self, unit_size: usize) -> Box<dyn MutationGrouper> {
        match self {
            Self::PerMutant => Box::new(PerMutantGrouper),
            Self::PerCodeUnit => Box::new(PerCodeUnitGrouper::new(unit_size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationIdentifier;

    fn mutants(pairs: &[(&str, u32)]) -> Vec<MutationDetails> {
        pairs.iter()
            .map(|(unit, index)| {
                MutationDetails::new(MutationIdentifier::new(*unit, "m", *index, "OP"), 1, "d")
            })
            .collect()
    }

    fn sizes(groups: &[Vec<MutationDetails>]) -> Vec<usize> {
        groups.iter().map(Vec::len).collect()
    }

    #[test]
    fn per_mutant_grouper_isolates_everything() {
        let groups = PerMutantGrouper.group(mutants(&[("a.A", 0), ("a.A", 1), ("b.B", 0)]));
        assert_eq!(sizes(&groups), vec![1, 1, 1]);
    }

    #[test]
    fn per_code_unit_grouper_respects_unit_boundaries_and_size() {
        let input = mutants(&[("a.A", 0), ("a.A", 1), ("a.A", 2), ("b.B", 0)]);
        assert_eq!(sizes(&PerCodeUnitGrouper::new(2).group(input.clone())), vec![2, 1, 1]);
        assert_eq!(sizes(&PerCodeUnitGrouper::new(0).group(input)), vec![3, 1]);
    }

    #[test]
    fn strategy_keys_deserialize() {
        let strategy: GroupingStrategy =
            serde_json::from_str("\"per-code-unit\"").expect("strategy should parse");
        assert_eq!(strategy, GroupingStrategy::PerCodeUnit);
        assert_eq!(sizes(&strategy.grouper(0).group(mutants(&[("a.A", 0), ("a.A", 1)]))), vec![2]);
    }
}
