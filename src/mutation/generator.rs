//! Mutant generation contract.

use super::details::MutationDetails;
use crate::model::CodeUnit;

/// Produces candidate mutants for a code unit.
///
/// Implementations must be deterministic: the same unit and operator set
/// always yield the same mutants in the same order.
pub trait MutationGenerator: Send + Sync {
    /// Mutants for `unit`, restricted to `operators` when non-empty.
    fn generate(&self, unit: &CodeUnit, operators: &[String]) -> Vec<MutationDetails>;
}

impl<G: MutationGenerator + ?Sized> MutationGenerator for std::sync::Arc<G> {
    fn generate(&self, unit: &CodeUnit, operators: &[String]) -> Vec<MutationDetails> {
        (**self).generate(unit, operators)
    }
}
