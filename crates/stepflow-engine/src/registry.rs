use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use stepflow_config::WorkflowDef;
use tracing::debug;

use crate::builder::WorkflowBuilder;
use crate::error::RegistryError;
use crate::graph::WorkflowGraph;
use crate::step::{Step, StepDelegate};

/// Named step delegates, used to turn a serialized [`WorkflowDef`] back into
/// a runnable [`WorkflowGraph`].
#[derive(Clone, Default)]
pub struct DelegateRegistry {
  delegates: HashMap<String, Arc<dyn StepDelegate>>,
}

impl DelegateRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a delegate under `name`.
  ///
  /// Names must be non-empty, contain no whitespace, and be unique within
  /// the registry.
  pub fn register(
    &mut self,
    name: impl Into<String>,
    delegate: impl StepDelegate + 'static,
  ) -> Result<(), RegistryError> {
    self.register_shared(name, Arc::new(delegate))
  }

  pub fn register_shared(
    &mut self,
    name: impl Into<String>,
    delegate: Arc<dyn StepDelegate>,
  ) -> Result<(), RegistryError> {
    let name = name.into();
    if name.is_empty() || name.chars().any(char::is_whitespace) {
      return Err(RegistryError::InvalidName { name });
    }
    if self.delegates.contains_key(&name) {
      return Err(RegistryError::DuplicateDelegate { name });
    }

    debug!(delegate = %name, "delegate_registered");
    self.delegates.insert(name, delegate);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn StepDelegate>> {
    self.delegates.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.delegates.contains_key(name)
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.delegates.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  /// Create a step backed by the delegate registered under `delegate`.
  pub fn step(
    &self,
    id: impl Into<String>,
    name: impl Into<String>,
    delegate: &str,
  ) -> Result<Step, RegistryError> {
    let id = id.into();
    let shared = self
      .get(delegate)
      .ok_or_else(|| RegistryError::UnknownDelegate {
        step_id: id.clone(),
        name: delegate.to_string(),
      })?;
    Ok(Step::with_shared_delegate(id, name, shared).with_delegate_name(delegate))
  }

  /// Build a graph from a definition, binding every step to its delegate.
  pub fn resolve(&self, def: WorkflowDef) -> Result<WorkflowGraph, RegistryError> {
    let mut builder = WorkflowBuilder::new(def.name)
      .description(def.description)
      .with_config(def.config);

    for step_def in def.steps {
      let delegate = step_def
        .delegate
        .as_deref()
        .ok_or_else(|| RegistryError::MissingDelegate {
          step_id: step_def.id.clone(),
        })?;

      let mut step = self
        .step(step_def.id.as_str(), step_def.name.as_str(), delegate)?
        .with_description(step_def.description)
        .with_parameters(step_def.parameters)
        .depends_on(step_def.depends_on);
      if let Some(timeout_ms) = step_def.timeout_ms {
        step = step.with_timeout(std::time::Duration::from_millis(timeout_ms));
      }
      if let Some(retry_count) = step_def.retry_count {
        step = step.with_retry_count(retry_count);
      }

      builder = builder.add_step(step)?;
    }

    Ok(builder.build()?)
  }
}

impl fmt::Debug for DelegateRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DelegateRegistry")
      .field("delegates", &self.names())
      .finish()
  }
}
