//! # mutascope
//!
//! `mutascope` is a mutation-testing pipeline organized around:
//! - `model`: lazily resolved code units and their content hashes
//! - `coverage`: per-test line coverage measured against unmutated code
//! - `build`: filtering, test prioritisation and grouping into analysis units
//! - `execute`: the minion process pool that runs tests against each mutant
//! - `history`: incremental reuse of verdicts across runs
//! - `stats` and `report`: scores, thresholds and listeners
//! - `pipeline`: the end-to-end run tying them together
//!
//! Mutant generation and test execution are pluggable through
//! [`mutation::MutationGenerator`] and [`execute::TestHarness`]; `project`
//! provides manifest-driven implementations of both.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod build;
pub mod config;
pub mod coverage;
pub mod execute;
pub mod history;
pub mod model;
pub mod mutation;
pub mod pipeline;
pub mod project;
pub mod report;
pub mod stats;

pub use config::MutationConfig;
pub use pipeline::{MutationCoverage, PipelineError};
