//! Delegates available to workflow files run from the command line.

use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use stepflow_engine::{DelegateRegistry, RegistryError, StepCall, delegate_fn};

/// Registry with every built-in delegate.
///
/// | name         | parameters                       | output                      |
/// |--------------|----------------------------------|-----------------------------|
/// | `echo`       | `message` (optional)             | `message`, else parameters  |
/// | `sleep`      | `duration_ms`                    | `duration_ms`               |
/// | `fail`       | `message` (optional)             | always fails                |
/// | `read_file`  | `path`                           | file contents as a string   |
/// | `write_file` | `path`, `contents` or `from`     | `{ path, bytes }`           |
pub fn registry() -> Result<DelegateRegistry, RegistryError> {
  let mut registry = DelegateRegistry::new();
  registry.register("echo", delegate_fn(echo))?;
  registry.register("sleep", delegate_fn(sleep))?;
  registry.register("fail", delegate_fn(fail))?;
  registry.register("read_file", delegate_fn(read_file))?;
  registry.register("write_file", delegate_fn(write_file))?;
  Ok(registry)
}

async fn echo(call: StepCall) -> anyhow::Result<Value> {
  Ok(match call.param("message") {
    Some(message) => message.clone(),
    None => Value::Object(call.parameters().clone()),
  })
}

async fn sleep(call: StepCall) -> anyhow::Result<Value> {
  let duration_ms = call
    .param("duration_ms")
    .and_then(Value::as_u64)
    .ok_or_else(|| anyhow!("parameter 'duration_ms' must be a non-negative integer"))?;

  tokio::select! {
    _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
    _ = call.cancellation().cancelled() => anyhow::bail!("sleep interrupted"),
  }
  Ok(json!({ "duration_ms": duration_ms }))
}

async fn fail(call: StepCall) -> anyhow::Result<Value> {
  let message = call.param_str("message").unwrap_or("step failed on request");
  Err(anyhow!("{message}"))
}

async fn read_file(call: StepCall) -> anyhow::Result<Value> {
  let path = required_str(&call, "path")?;
  let contents = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read {path}"))?;
  Ok(Value::String(contents))
}

/// Writes `contents`, or the output of the step named by `from`. String
/// outputs are written verbatim, anything else as pretty JSON.
async fn write_file(call: StepCall) -> anyhow::Result<Value> {
  let path = required_str(&call, "path")?;

  let value = match (call.param("contents"), call.param_str("from")) {
    (Some(contents), _) => contents.clone(),
    (None, Some(from)) => call
      .context()
      .get_result(from)
      .with_context(|| format!("no result recorded for step '{from}'"))?,
    (None, None) => anyhow::bail!("either 'contents' or 'from' is required"),
  };
  let contents = match value {
    Value::String(s) => s,
    other => serde_json::to_string_pretty(&other)?,
  };

  tokio::fs::write(path, &contents)
    .await
    .with_context(|| format!("failed to write {path}"))?;
  Ok(json!({ "path": path, "bytes": contents.len() }))
}

fn required_str<'a>(call: &'a StepCall, key: &str) -> anyhow::Result<&'a str> {
  call
    .param_str(key)
    .with_context(|| format!("parameter '{key}' is required"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use stepflow_engine::{Runner, StepState, WorkflowDef};

  fn workflow(steps: Value) -> WorkflowDef {
    serde_json::from_value(json!({
      "name": "builtin",
      "config": { "default_retry_count": 0 },
      "steps": steps,
    }))
    .unwrap()
  }

  #[test]
  fn test_registry_names() {
    let registry = registry().unwrap();
    assert_eq!(
      registry.names(),
      vec!["echo", "fail", "read_file", "sleep", "write_file"]
    );
  }

  #[tokio::test]
  async fn test_write_then_read_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let path = path.to_str().unwrap();

    let def = workflow(json!([
      { "id": "greet", "name": "Greet", "delegate": "echo",
        "parameters": { "message": "hello" } },
      { "id": "save", "name": "Save", "delegate": "write_file",
        "parameters": { "path": path, "from": "greet" }, "depends_on": ["greet"] },
      { "id": "load", "name": "Load", "delegate": "read_file",
        "parameters": { "path": path }, "depends_on": ["save"] }
    ]));
    let graph = registry().unwrap().resolve(def).unwrap();

    let result = Runner::new().execute(&graph).await.unwrap();
    assert!(result.success);
    assert_eq!(result.output("save").unwrap()["bytes"], 5);
    assert_eq!(result.final_output(), Some(&json!("hello")));
  }

  #[tokio::test]
  async fn test_fail_and_missing_parameters() {
    let def = workflow(json!([
      { "id": "fail", "name": "Fail", "delegate": "fail",
        "parameters": { "message": "disk full" } },
      { "id": "nap", "name": "Nap", "delegate": "sleep" },
      { "id": "read", "name": "Read", "delegate": "read_file" }
    ]));
    let graph = registry().unwrap().resolve(def).unwrap();

    let result = Runner::new().execute(&graph).await.unwrap();
    assert_eq!(result.failed_steps(), vec!["fail", "nap", "read"]);

    let error = result.step("fail").unwrap().error.as_ref().unwrap();
    assert!(error.to_string().ends_with("disk full"));
  }

  #[tokio::test]
  async fn test_echo_returns_parameters_without_message() {
    let def = workflow(json!([
      { "id": "echo", "name": "Echo", "delegate": "echo",
        "parameters": { "n": 1 } },
      { "id": "nap", "name": "Nap", "delegate": "sleep",
        "parameters": { "duration_ms": 5 } }
    ]));
    let graph = registry().unwrap().resolve(def).unwrap();

    let result = Runner::new().execute(&graph).await.unwrap();
    assert_eq!(result.output("echo"), Some(&json!({ "n": 1 })));
    assert_eq!(result.state_of("nap"), Some(StepState::Succeeded));
  }
}
