use serde::{Deserialize, Serialize};

/// Named parameters handed to a step delegate.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Serializable form of a single step.
///
/// The delegate is referenced by the name it was registered under, never
/// embedded, so a definition can cross process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,
  /// Registered delegate name. `None` for steps built from anonymous closures.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub delegate: Option<String>,
  #[serde(default)]
  pub parameters: Parameters,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_count: Option<u32>,
}
