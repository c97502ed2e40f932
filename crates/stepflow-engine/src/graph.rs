use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stepflow_config::{ExecutionConfig, StepDef, WorkflowDef};
use stepflow_workflow::Graph;

use crate::retry::RetryPolicy;
use crate::step::Step;

/// An immutable, validated workflow.
///
/// Produced by [`crate::WorkflowBuilder::build`]. Cloning is cheap and a
/// single graph may be run any number of times, sequentially or
/// concurrently; each run gets its own context and result.
#[derive(Clone)]
pub struct WorkflowGraph {
  inner: Arc<Inner>,
}

struct Inner {
  name: String,
  description: String,
  config: ExecutionConfig,
  steps: Vec<Arc<Step>>,
  topology: Graph,
}

impl WorkflowGraph {
  pub(crate) fn new(
    name: String,
    description: String,
    config: ExecutionConfig,
    steps: Vec<Step>,
    topology: Graph,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        name,
        description,
        config,
        steps: steps.into_iter().map(Arc::new).collect(),
        topology,
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn description(&self) -> &str {
    &self.inner.description
  }

  pub fn config(&self) -> &ExecutionConfig {
    &self.inner.config
  }

  /// Steps in insertion order.
  pub fn steps(&self) -> &[Arc<Step>] {
    &self.inner.steps
  }

  pub fn step(&self, step_id: &str) -> Option<&Arc<Step>> {
    self
      .inner
      .topology
      .index_of(step_id)
      .map(|i| &self.inner.steps[i])
  }

  /// Dependency topology; indices match [`WorkflowGraph::steps`].
  pub fn topology(&self) -> &Graph {
    &self.inner.topology
  }

  pub fn len(&self) -> usize {
    self.inner.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.steps.is_empty()
  }

  /// A valid sequential execution order.
  pub fn execution_order(&self) -> Vec<&str> {
    self.inner.topology.topological_ids()
  }

  /// Effective per-attempt timeout of a step.
  pub fn timeout_for(&self, step: &Step) -> Duration {
    step
      .timeout()
      .unwrap_or_else(|| self.inner.config.default_timeout())
  }

  /// Effective retry policy of a step.
  pub fn retry_policy_for(&self, step: &Step) -> RetryPolicy {
    let retries = step
      .retry_count()
      .unwrap_or(self.inner.config.default_retry_count);
    RetryPolicy::new(&self.inner.config, retries)
  }

  /// Serializable form of this workflow.
  ///
  /// Delegates are referenced by registered name; steps built from
  /// unregistered delegates carry no name and cannot be resolved back.
  pub fn to_def(&self) -> WorkflowDef {
    WorkflowDef {
      name: self.inner.name.clone(),
      description: self.inner.description.clone(),
      config: self.inner.config.clone(),
      steps: self
        .inner
        .steps
        .iter()
        .map(|step| StepDef {
          id: step.id().to_string(),
          name: step.name().to_string(),
          description: step.description().to_string(),
          delegate: step.delegate_name().map(String::from),
          parameters: step.parameters().clone(),
          depends_on: step.dependencies().to_vec(),
          timeout_ms: step.timeout().map(|t| t.as_millis() as u64),
          retry_count: step.retry_count(),
        })
        .collect(),
    }
  }
}

impl fmt::Debug for WorkflowGraph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkflowGraph")
      .field("name", &self.inner.name)
      .field("config", &self.inner.config)
      .field("steps", &self.inner.steps)
      .finish()
  }
}
