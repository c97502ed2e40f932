use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;
use crate::step::StepDef;

/// Serializable form of a whole workflow: steps, dependency edges and config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,
  #[serde(default)]
  pub config: ExecutionConfig,
  pub steps: Vec<StepDef>,
}

impl WorkflowDef {
  /// Get a step definition by ID.
  pub fn get_step(&self, step_id: &str) -> Option<&StepDef> {
    self.steps.iter().find(|s| s.id == step_id)
  }
}
