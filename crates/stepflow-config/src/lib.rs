//! Stepflow Config
//!
//! This crate contains the serializable workflow configuration types for stepflow.
//! These types represent workflow definitions before their delegates are resolved
//! and the dependency graph is validated by the engine.
//!
//! Definitions can be loaded from:
//! - JSON files (via the CLI, `stepflow run workflow.json`)
//! - Any other serde source (the engine only sees the typed structs)
//!
//! The engine resolves delegate names against a registry, validates the step
//! graph, and produces an immutable workflow graph ready for execution.

mod config;
mod enums;
mod step;
mod workflow;

pub use config::ExecutionConfig;
pub use enums::RetryBackoff;
pub use step::{Parameters, StepDef};
pub use workflow::WorkflowDef;
