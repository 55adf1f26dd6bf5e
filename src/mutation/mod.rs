//! Mutants and their verdicts.

pub mod details;
pub mod generator;
pub mod status;

pub use details::{MutationDetails, MutationIdentifier, TestInfo};
pub use generator::MutationGenerator;
pub use status::{ClassMutationResults, DetectionStatus, MutationResult, StatusMap, StatusTestPair};
