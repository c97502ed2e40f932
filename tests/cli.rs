use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

fn stepflow(args: &[&str]) -> Output {
  Command::new(env!("CARGO_BIN_EXE_stepflow"))
    .args(args)
    .env("RUST_LOG", "off")
    .output()
    .expect("failed to run stepflow binary")
}

fn write_workflow(dir: &Path, workflow: Value) -> String {
  let path = dir.join("workflow.json");
  std::fs::write(&path, serde_json::to_vec_pretty(&workflow).unwrap()).unwrap();
  path.to_str().unwrap().to_string()
}

#[test]
fn test_run_prints_result_json() {
  let dir = tempfile::tempdir().unwrap();
  let out = dir.path().join("greeting.txt");
  let workflow = write_workflow(
    dir.path(),
    json!({
      "name": "greet",
      "steps": [
        { "id": "hello", "name": "Hello", "delegate": "echo",
          "parameters": { "message": "hi there" } },
        { "id": "save", "name": "Save", "delegate": "write_file",
          "parameters": { "path": out.to_str().unwrap(), "from": "hello" },
          "depends_on": ["hello"] }
      ]
    }),
  );

  let output = stepflow(&["run", &workflow]);
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let result: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(result["status"], "completed");
  assert_eq!(result["execution_order"], json!(["hello", "save"]));
  assert_eq!(std::fs::read_to_string(&out).unwrap(), "hi there");
}

#[test]
fn test_run_with_failure_exits_nonzero() {
  let dir = tempfile::tempdir().unwrap();
  let workflow = write_workflow(
    dir.path(),
    json!({
      "name": "broken",
      "steps": [
        { "id": "bad", "name": "Bad", "delegate": "fail" },
        { "id": "after", "name": "After", "delegate": "echo", "depends_on": ["bad"] },
        { "id": "other", "name": "Other", "delegate": "echo" }
      ]
    }),
  );

  let output = stepflow(&["run", &workflow, "--retries", "0", "--max-parallel", "1"]);
  assert!(!output.status.success());

  let result: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(result["status"], "partial_success");
  assert_eq!(result["steps"][0]["state"], "failed");
  assert_eq!(result["steps"][0]["attempts"], 1);
  assert_eq!(result["steps"][1]["state"], "skipped");
  assert_eq!(result["steps"][2]["state"], "succeeded");
}

#[test]
fn test_validate_reports_cycle() {
  let dir = tempfile::tempdir().unwrap();
  let workflow = write_workflow(
    dir.path(),
    json!({
      "name": "loop",
      "steps": [
        { "id": "a", "name": "A", "delegate": "echo", "depends_on": ["b"] },
        { "id": "b", "name": "B", "delegate": "echo", "depends_on": ["a"] }
      ]
    }),
  );

  let output = stepflow(&["validate", &workflow]);
  assert!(!output.status.success());
  assert!(String::from_utf8_lossy(&output.stderr).contains("cyclic dependency: a -> b -> a"));
}

#[test]
fn test_validate_lists_execution_order() {
  let dir = tempfile::tempdir().unwrap();
  let workflow = write_workflow(
    dir.path(),
    json!({
      "name": "etl",
      "steps": [
        { "id": "load", "name": "Load", "delegate": "echo", "depends_on": ["extract"] },
        { "id": "extract", "name": "Extract", "delegate": "echo" }
      ]
    }),
  );

  let output = stepflow(&["validate", &workflow]);
  assert!(output.status.success());

  let stdout = String::from_utf8_lossy(&output.stdout);
  assert!(stdout.starts_with("workflow 'etl' is valid: 2 steps"));
  let extract = stdout.find("extract (Extract)").unwrap();
  let load = stdout.find("load (Load) [echo] after extract").unwrap();
  assert!(extract < load);
}

#[test]
fn test_show_prints_normalized_definition() {
  let dir = tempfile::tempdir().unwrap();
  let workflow = write_workflow(
    dir.path(),
    json!({
      "name": "etl",
      "steps": [{ "id": "extract", "name": "Extract", "delegate": "echo" }]
    }),
  );

  let output = stepflow(&["show", &workflow]);
  assert!(output.status.success());

  let def: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(def["config"]["max_parallel_steps"], 3);
  assert_eq!(def["config"]["retry_backoff"], "exponential");
  assert_eq!(def["steps"][0]["delegate"], "echo");
  assert_eq!(def["steps"][0]["depends_on"], json!([]));
}
