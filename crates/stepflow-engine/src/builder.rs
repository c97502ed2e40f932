use std::collections::HashSet;

use stepflow_config::ExecutionConfig;
use stepflow_workflow::{Graph, WorkflowError};
use tracing::debug;

use crate::graph::WorkflowGraph;
use crate::step::Step;

/// Accumulates steps and configuration, then freezes them into a
/// [`WorkflowGraph`].
///
/// Duplicate ids are rejected as steps are added. Dependencies may name
/// steps added later; they are resolved, and cycles detected, by
/// [`WorkflowBuilder::build`].
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
  name: String,
  description: String,
  config: ExecutionConfig,
  steps: Vec<Step>,
  ids: HashSet<String>,
}

impl WorkflowBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      description: String::new(),
      config: ExecutionConfig::default(),
      steps: Vec::new(),
      ids: HashSet::new(),
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Replace the execution config. The last call wins.
  pub fn with_config(mut self, config: ExecutionConfig) -> Self {
    self.config = config;
    self
  }

  /// Append a step.
  pub fn add_step(mut self, step: Step) -> Result<Self, WorkflowError> {
    if step.id().is_empty() {
      return Err(WorkflowError::EmptyStepId);
    }
    if !self.ids.insert(step.id().to_string()) {
      return Err(WorkflowError::DuplicateStep {
        step_id: step.id().to_string(),
      });
    }
    self.steps.push(step);
    Ok(self)
  }

  /// Append several steps in order.
  pub fn add_steps(self, steps: impl IntoIterator<Item = Step>) -> Result<Self, WorkflowError> {
    steps.into_iter().try_fold(self, Self::add_step)
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Validate configuration and dependencies and produce the graph.
  ///
  /// Fails on an unknown dependency, a cycle, or a config with
  /// `max_parallel_steps == 0`. No partial graph is produced.
  pub fn build(self) -> Result<WorkflowGraph, WorkflowError> {
    if self.config.max_parallel_steps == 0 {
      return Err(WorkflowError::InvalidConfig {
        message: "max_parallel_steps must be at least 1".to_string(),
      });
    }

    let topology = Graph::new(self.steps.iter().map(|step| {
      (
        step.id(),
        step.dependencies().iter().map(String::as_str),
      )
    }))?;

    debug!(
      workflow = %self.name,
      steps = self.steps.len(),
      entry_points = topology.entry_points().len(),
      "workflow_built"
    );

    Ok(WorkflowGraph::new(
      self.name,
      self.description,
      self.config,
      self.steps,
      topology,
    ))
  }
}
