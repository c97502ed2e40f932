//! Stepflow Engine
//!
//! This crate provides the workflow execution engine for stepflow: the
//! builder that freezes a list of steps into an immutable [`WorkflowGraph`],
//! and the [`Runner`] that executes it against an [`ExecutionContext`].
//!
//! # Architecture
//!
//! ```text
//! WorkflowBuilder ── add_step / with_config / build ──▶ WorkflowGraph
//!                                                           │
//! DelegateRegistry ── resolve(WorkflowDef) ─────────────────┤
//!                                                           ▼
//! Runner::run(graph, context) ──────────────────────▶ WorkflowResult
//!   - ready set ordered by insertion index
//!   - at most `max_parallel_steps` delegates in flight
//!   - per-attempt timeout, retry with backoff
//!   - failed steps skip their transitive dependents
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stepflow_engine::{ExecutionConfig, Runner, Step, WorkflowBuilder, delegate_fn};
//!
//! let graph = WorkflowBuilder::new("release")
//!     .with_config(ExecutionConfig { max_parallel_steps: 2, ..Default::default() })
//!     .add_step(Step::new("validate", "Validate", delegate_fn(|_call| async { Ok(json!(true)) })))?
//!     .add_step(Step::new("notify", "Notify", notify).depends_on(["validate"]))?
//!     .build()?;
//!
//! let result = Runner::new().execute(&graph).await?;
//! assert!(result.success);
//! ```

mod builder;
mod context;
mod error;
mod events;
mod graph;
mod registry;
mod result;
mod retry;
mod runner;
mod step;

pub use builder::WorkflowBuilder;
pub use context::{ExecutionContext, Resource};
pub use error::{ContextError, RegistryError, RuntimeError, StepError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use graph::WorkflowGraph;
pub use registry::DelegateRegistry;
pub use result::{SkipReason, StepRecord, StepState, WorkflowResult, WorkflowStatus};
pub use retry::RetryPolicy;
pub use runner::Runner;
pub use step::{Condition, FnDelegate, Step, StepCall, StepDelegate, delegate_fn};

pub use stepflow_config::{ExecutionConfig, Parameters, RetryBackoff, StepDef, WorkflowDef};
pub use stepflow_workflow::{Graph, WorkflowError};
