//! Steps and the delegates that perform their work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stepflow_config::Parameters;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;

/// The unit of work behind a step.
///
/// A delegate is invoked once per attempt. It may read results of completed
/// steps and shared resources through [`StepCall::context`], and should watch
/// [`StepCall::cancellation`] for long-running work: when an attempt times out
/// or the run is cancelled, the in-flight future is dropped and the token is
/// cancelled. Work a delegate hands off to its own spawned tasks is not
/// stopped by the engine.
#[async_trait]
pub trait StepDelegate: Send + Sync {
  async fn execute(&self, call: StepCall) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`StepDelegate`]. Built by [`delegate_fn`].
pub struct FnDelegate<F>(F);

/// Wrap an async closure as a step delegate.
///
/// ```ignore
/// let fetch = delegate_fn(|call: StepCall| async move {
///   let url = call.param_str("url").unwrap_or("http://localhost");
///   Ok(json!({ "url": url }))
/// });
/// ```
pub fn delegate_fn<F, Fut>(f: F) -> FnDelegate<F>
where
  F: Fn(StepCall) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
  FnDelegate(f)
}

#[async_trait]
impl<F, Fut> StepDelegate for FnDelegate<F>
where
  F: Fn(StepCall) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
  async fn execute(&self, call: StepCall) -> anyhow::Result<Value> {
    (self.0)(call).await
  }
}

/// Predicate deciding whether a ready step runs. See [`Step::with_condition`].
pub type Condition = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// A named unit of work with dependencies.
///
/// Built with [`Step::new`] and the `with_*` / [`Step::depends_on`] methods,
/// then handed to [`crate::WorkflowBuilder::add_step`]. Once a graph is built
/// its steps are shared read-only; per-run state lives in
/// [`crate::WorkflowResult`].
#[derive(Clone)]
pub struct Step {
  id: String,
  name: String,
  description: String,
  delegate: Arc<dyn StepDelegate>,
  delegate_name: Option<String>,
  parameters: Parameters,
  depends_on: Vec<String>,
  timeout: Option<Duration>,
  retry_count: Option<u32>,
  condition: Option<Condition>,
}

impl Step {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    delegate: impl StepDelegate + 'static,
  ) -> Self {
    Self::with_shared_delegate(id, name, Arc::new(delegate))
  }

  /// Create a step around a delegate that is shared with other steps.
  pub fn with_shared_delegate(
    id: impl Into<String>,
    name: impl Into<String>,
    delegate: Arc<dyn StepDelegate>,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      description: String::new(),
      delegate,
      delegate_name: None,
      parameters: Parameters::new(),
      depends_on: Vec::new(),
      timeout: None,
      retry_count: None,
      condition: None,
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Replace the step's parameters.
  pub fn with_parameters(mut self, parameters: Parameters) -> Self {
    self.parameters = parameters;
    self
  }

  /// Set a single parameter.
  pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.parameters.insert(key.into(), value.into());
    self
  }

  /// Add dependencies. Repeated ids are kept once.
  pub fn depends_on<I, S>(mut self, ids: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for id in ids {
      let id = id.into();
      if !self.depends_on.contains(&id) {
        self.depends_on.push(id);
      }
    }
    self
  }

  /// Per-attempt timeout; overrides the workflow default.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Retries after the first failed attempt; overrides the workflow default.
  pub fn with_retry_count(mut self, retry_count: u32) -> Self {
    self.retry_count = Some(retry_count);
    self
  }

  /// Run the step only if `condition` holds once its dependencies have
  /// succeeded. Otherwise it is skipped, and so is everything depending on it.
  ///
  /// ```ignore
  /// let deploy = Step::new("deploy", "Deploy", deployer)
  ///   .depends_on(["discover"])
  ///   .with_condition(|ctx| ctx.get_shared("helm_release").is_some());
  /// ```
  pub fn with_condition<F>(mut self, condition: F) -> Self
  where
    F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
  {
    self.condition = Some(Arc::new(condition));
    self
  }

  /// Name the delegate was registered under, kept for [`crate::WorkflowGraph::to_def`].
  pub fn with_delegate_name(mut self, name: impl Into<String>) -> Self {
    self.delegate_name = Some(name.into());
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn delegate(&self) -> &Arc<dyn StepDelegate> {
    &self.delegate
  }

  pub fn delegate_name(&self) -> Option<&str> {
    self.delegate_name.as_deref()
  }

  pub fn parameters(&self) -> &Parameters {
    &self.parameters
  }

  pub fn dependencies(&self) -> &[String] {
    &self.depends_on
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  pub fn retry_count(&self) -> Option<u32> {
    self.retry_count
  }

  pub fn condition(&self) -> Option<&Condition> {
    self.condition.as_ref()
  }
}

impl fmt::Debug for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Step")
      .field("id", &self.id)
      .field("name", &self.name)
      .field("delegate", &self.delegate_name)
      .field("depends_on", &self.depends_on)
      .field("timeout", &self.timeout)
      .field("retry_count", &self.retry_count)
      .field("conditional", &self.condition.is_some())
      .finish_non_exhaustive()
  }
}

/// Everything a delegate receives for one attempt.
#[derive(Clone)]
pub struct StepCall {
  context: Arc<ExecutionContext>,
  step: Arc<Step>,
  attempt: u32,
  cancel: CancellationToken,
}

impl StepCall {
  pub(crate) fn new(
    context: Arc<ExecutionContext>,
    step: Arc<Step>,
    attempt: u32,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      context,
      step,
      attempt,
      cancel,
    }
  }

  /// Shared state of the current run.
  pub fn context(&self) -> &ExecutionContext {
    &self.context
  }

  pub fn step(&self) -> &Step {
    &self.step
  }

  pub fn step_id(&self) -> &str {
    self.step.id()
  }

  pub fn parameters(&self) -> &Parameters {
    self.step.parameters()
  }

  pub fn param(&self, key: &str) -> Option<&Value> {
    self.step.parameters().get(key)
  }

  pub fn param_str(&self, key: &str) -> Option<&str> {
    self.param(key).and_then(Value::as_str)
  }

  /// Attempt number, starting at 1.
  pub fn attempt(&self) -> u32 {
    self.attempt
  }

  /// Cancelled when this attempt times out or the run is cancelled.
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }
}
