use thiserror::Error;

/// Errors raised while validating a workflow. No partial graph is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
  #[error("step id must not be empty")]
  EmptyStepId,

  #[error("duplicate step id: {step_id}")]
  DuplicateStep { step_id: String },

  #[error("step '{step_id}' depends on unknown step '{dependency}'")]
  UnknownDependency { step_id: String, dependency: String },

  #[error("cyclic dependency: {}", cycle.join(" -> "))]
  CyclicDependency { cycle: Vec<String> },

  #[error("invalid workflow config: {message}")]
  InvalidConfig { message: String },
}
