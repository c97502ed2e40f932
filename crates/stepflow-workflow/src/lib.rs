//! Stepflow Workflow
//!
//! This crate provides the validated dependency topology for stepflow.
//! A [`Graph`] is only ever constructed from a step list that passed
//! validation:
//! - step ids are non-empty and unique
//! - every dependency references a step in the same list
//! - the dependency relation is acyclic
//!
//! Steps are addressed by their insertion index. Insertion order is the
//! deterministic tie-break used for topological ordering and scheduling.

mod error;
mod graph;

pub use error::WorkflowError;
pub use graph::Graph;
