//! Shared state for a single workflow run.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::ContextError;

/// A lazily created handle shared by all steps of a run, such as a client
/// or connection pool.
///
/// Resources are created on first request through
/// [`ExecutionContext::resource`] and closed once when the run ends,
/// most recently created first.
#[async_trait]
pub trait Resource: Any + Send + Sync {
  async fn close(&self) -> anyhow::Result<()> {
    Ok(())
  }
}

struct ResourceEntry {
  value: Arc<dyn Any + Send + Sync>,
  handle: Arc<dyn Resource>,
  closed: AtomicBool,
}

impl ResourceEntry {
  /// Close the handle unless someone already did.
  async fn close_once(&self, name: &str) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    match self.handle.close().await {
      Ok(()) => debug!(resource = %name, "resource_closed"),
      Err(e) => warn!(resource = %name, error = %format!("{e:#}"), "resource_close_failed"),
    }
  }
}

type ResourceSlot = Arc<OnceCell<ResourceEntry>>;

/// Run-scoped state: identity, metadata, completed step results, values
/// published by delegates and shared resources.
///
/// Results are write-once per step. The runner records a step's output
/// before any of its dependents start, so a delegate always sees the
/// results of its dependencies. Shared values are last-write-wins.
pub struct ExecutionContext {
  run_id: String,
  started_at: DateTime<Utc>,
  metadata: HashMap<String, String>,
  results: RwLock<HashMap<String, Value>>,
  shared: RwLock<HashMap<String, Value>>,
  resources: Mutex<Vec<(String, ResourceSlot)>>,
  released: AtomicBool,
}

impl ExecutionContext {
  pub fn new() -> Self {
    Self {
      run_id: uuid::Uuid::new_v4().to_string(),
      started_at: Utc::now(),
      metadata: HashMap::new(),
      results: RwLock::new(HashMap::new()),
      shared: RwLock::new(HashMap::new()),
      resources: Mutex::new(Vec::new()),
      released: AtomicBool::new(false),
    }
  }

  /// Attach a metadata entry visible to every step.
  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn started_at(&self) -> DateTime<Utc> {
    self.started_at
  }

  pub fn metadata(&self, key: &str) -> Option<&str> {
    self.metadata.get(key).map(String::as_str)
  }

  pub fn all_metadata(&self) -> &HashMap<String, String> {
    &self.metadata
  }

  /// Output of a step that completed in this run.
  ///
  /// `None` means the step has not completed successfully (yet).
  pub fn get_result(&self, step_id: &str) -> Option<Value> {
    self
      .results
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(step_id)
      .cloned()
  }

  /// Output of a completed step, deserialized into `T`.
  pub fn result_as<T: DeserializeOwned>(&self, step_id: &str) -> Result<T, ContextError> {
    let value = self
      .get_result(step_id)
      .ok_or_else(|| ContextError::ResultUnavailable {
        step_id: step_id.to_string(),
      })?;

    serde_json::from_value(value).map_err(|e| ContextError::ResultDecode {
      step_id: step_id.to_string(),
      message: e.to_string(),
    })
  }

  pub fn has_result(&self, step_id: &str) -> bool {
    self
      .results
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(step_id)
  }

  /// Snapshot of every recorded result.
  pub fn results(&self) -> HashMap<String, Value> {
    self
      .results
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub(crate) fn record_result(&self, step_id: &str, value: Value) -> Result<(), ContextError> {
    let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
    if results.contains_key(step_id) {
      return Err(ContextError::ResultAlreadyRecorded {
        step_id: step_id.to_string(),
      });
    }
    results.insert(step_id.to_string(), value);
    Ok(())
  }

  /// Publish a value for later steps, returning the one it replaced.
  ///
  /// A step that writes a value before it succeeds makes it visible to all
  /// of its dependents.
  pub fn set_shared(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self
      .shared
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.into(), value.into())
  }

  pub fn get_shared(&self, key: &str) -> Option<Value> {
    self
      .shared
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  /// A shared value deserialized into `T`; `None` when unset or of another shape.
  pub fn shared_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .get_shared(key)
      .and_then(|value| serde_json::from_value(value).ok())
  }

  /// Snapshot of every shared value.
  pub fn shared_values(&self) -> HashMap<String, Value> {
    self
      .shared
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Get the shared resource registered under `name`, creating it with
  /// `factory` on first use.
  ///
  /// Concurrent first requests run the factory once; the others wait for
  /// it. A failed factory leaves the slot empty so a later request retries.
  pub async fn resource<T, F, Fut>(&self, name: &str, factory: F) -> Result<Arc<T>, ContextError>
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
  {
    if self.released.load(Ordering::Acquire) {
      return Err(ContextError::ResourcesReleased {
        name: name.to_string(),
      });
    }

    let slot = {
      let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
      match resources.iter().find(|(existing, _)| existing == name) {
        Some((_, slot)) => slot.clone(),
        None => {
          let slot = ResourceSlot::default();
          resources.push((name.to_string(), slot.clone()));
          slot
        }
      }
    };

    let entry = slot
      .get_or_try_init(|| async {
        let resource = factory().await.map_err(|e| ContextError::ResourceInit {
          name: name.to_string(),
          message: format!("{e:#}"),
        })?;
        let resource = Arc::new(resource);
        debug!(resource = %name, "resource_created");
        Ok::<_, ContextError>(ResourceEntry {
          value: resource.clone(),
          handle: resource,
          closed: AtomicBool::new(false),
        })
      })
      .await?;

    // The run may have released while the factory was running.
    if self.released.load(Ordering::Acquire) {
      entry.close_once(name).await;
      return Err(ContextError::ResourcesReleased {
        name: name.to_string(),
      });
    }

    entry
      .value
      .clone()
      .downcast::<T>()
      .map_err(|_| ContextError::ResourceTypeMismatch {
        name: name.to_string(),
        expected: type_name::<T>(),
      })
  }

  /// Close every created resource exactly once, newest first.
  ///
  /// Close failures are logged and do not affect the run's outcome.
  pub(crate) async fn release_resources(&self) {
    if self.released.swap(true, Ordering::AcqRel) {
      return;
    }

    let slots: Vec<(String, ResourceSlot)> = self
      .resources
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .drain(..)
      .collect();

    for (name, slot) in slots.into_iter().rev() {
      if let Some(entry) = slot.get() {
        entry.close_once(&name).await;
      }
    }
  }
}

impl Default for ExecutionContext {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct Pool {
    closed: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl Resource for Pool {
    async fn close(&self) -> anyhow::Result<()> {
      self.closed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct Other;

  impl Resource for Other {}

  #[test]
  fn test_results_are_write_once() {
    let ctx = ExecutionContext::new();
    ctx.record_result("a", json!(1)).unwrap();

    let err = ctx.record_result("a", json!(2)).unwrap_err();
    assert_eq!(
      err,
      ContextError::ResultAlreadyRecorded {
        step_id: "a".to_string()
      }
    );
    assert_eq!(ctx.get_result("a"), Some(json!(1)));
  }

  #[test]
  fn test_missing_result() {
    let ctx = ExecutionContext::new();
    assert_eq!(ctx.get_result("nope"), None);
    assert!(!ctx.has_result("nope"));
    assert!(matches!(
      ctx.result_as::<u32>("nope"),
      Err(ContextError::ResultUnavailable { .. })
    ));
  }

  #[test]
  fn test_result_as_decodes() {
    let ctx = ExecutionContext::new();
    ctx.record_result("count", json!(42)).unwrap();
    assert_eq!(ctx.result_as::<u32>("count").unwrap(), 42);
    assert!(matches!(
      ctx.result_as::<String>("count"),
      Err(ContextError::ResultDecode { .. })
    ));
  }

  #[test]
  fn test_metadata_and_identity() {
    let ctx = ExecutionContext::new().with_metadata("env", "staging");
    assert_eq!(ctx.metadata("env"), Some("staging"));
    assert_eq!(ctx.metadata("region"), None);
    assert!(uuid::Uuid::parse_str(ctx.run_id()).is_ok());
    assert_ne!(ctx.run_id(), ExecutionContext::new().run_id());
  }

  #[tokio::test]
  async fn test_resource_created_once_and_closed_once() {
    let ctx = ExecutionContext::new();
    let closed = Arc::new(AtomicUsize::new(0));
    let created = AtomicUsize::new(0);

    for _ in 0..3 {
      let closed = closed.clone();
      let pool = ctx
        .resource("pool", || async {
          created.fetch_add(1, Ordering::SeqCst);
          Ok(Pool { closed })
        })
        .await
        .unwrap();
      assert_eq!(pool.closed.load(Ordering::SeqCst), 0);
    }
    assert_eq!(created.load(Ordering::SeqCst), 1);

    ctx.release_resources().await;
    ctx.release_resources().await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let err = ctx
      .resource("pool", || async { Ok(Pool::default()) })
      .await
      .err()
      .unwrap();
    assert!(matches!(err, ContextError::ResourcesReleased { .. }));
  }

  #[tokio::test]
  async fn test_resource_created_during_release_is_closed() {
    let ctx = ExecutionContext::new();
    let closed = Arc::new(AtomicUsize::new(0));

    // The factory is still running when the run releases its resources.
    let err = ctx
      .resource("pool", || async {
        ctx.release_resources().await;
        Ok(Pool {
          closed: closed.clone(),
        })
      })
      .await
      .err()
      .unwrap();

    assert!(matches!(err, ContextError::ResourcesReleased { .. }));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_shared_values_last_write_wins() {
    let ctx = ExecutionContext::new();
    assert_eq!(ctx.get_shared("owner"), None);

    assert_eq!(ctx.set_shared("owner", "platform"), None);
    assert_eq!(ctx.set_shared("owner", "data"), Some(json!("platform")));
    ctx.set_shared("replicas", 3);

    assert_eq!(ctx.get_shared("owner"), Some(json!("data")));
    assert_eq!(ctx.shared_as::<u32>("replicas"), Some(3));
    assert_eq!(ctx.shared_as::<u32>("owner"), None);
    assert_eq!(ctx.shared_values().len(), 2);
  }

  #[tokio::test]
  async fn test_resource_type_mismatch() {
    let ctx = ExecutionContext::new();
    ctx
      .resource("client", || async { Ok(Pool::default()) })
      .await
      .unwrap();

    let err = ctx
      .resource("client", || async { Ok(Other) })
      .await
      .err()
      .unwrap();
    assert!(matches!(err, ContextError::ResourceTypeMismatch { .. }));
  }

  #[tokio::test]
  async fn test_failed_factory_is_retried() {
    let ctx = ExecutionContext::new();
    let err = ctx
      .resource::<Pool, _, _>("pool", || async { anyhow::bail!("connection refused") })
      .await
      .err()
      .unwrap();
    assert_eq!(
      err,
      ContextError::ResourceInit {
        name: "pool".to_string(),
        message: "connection refused".to_string(),
      }
    );

    assert!(ctx.resource("pool", || async { Ok(Pool::default()) }).await.is_ok());
  }
}
