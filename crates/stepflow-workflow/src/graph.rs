use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::WorkflowError;

/// Validated dependency topology of a workflow.
///
/// Steps are addressed by insertion index; `upstream` holds what a step
/// depends on, `downstream` holds what depends on it.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Step ids in insertion order.
  ids: Vec<String>,
  /// Reverse lookup: step id -> insertion index.
  index: HashMap<String, usize>,
  /// Direct dependencies per step, deduplicated, in declaration order.
  upstream: Vec<Vec<usize>>,
  /// Direct dependents per step, in insertion order.
  downstream: Vec<Vec<usize>>,
  /// Steps with no dependencies.
  entry_points: Vec<usize>,
  /// Dependencies before dependents, ties broken by insertion order.
  topological_order: Vec<usize>,
}

impl Graph {
  /// Validate a step list and build its graph.
  ///
  /// Each item is a step id paired with the ids it depends on. Checks run
  /// in order: empty or duplicate ids, unknown dependencies, then cycles.
  pub fn new<'a, I, D>(steps: I) -> Result<Self, WorkflowError>
  where
    I: IntoIterator<Item = (&'a str, D)>,
    D: IntoIterator<Item = &'a str>,
  {
    let steps: Vec<(&str, Vec<&str>)> = steps
      .into_iter()
      .map(|(id, deps)| (id, deps.into_iter().collect()))
      .collect();

    let mut ids = Vec::with_capacity(steps.len());
    let mut index = HashMap::with_capacity(steps.len());
    for (id, _) in &steps {
      if id.is_empty() {
        return Err(WorkflowError::EmptyStepId);
      }
      if index.insert(id.to_string(), ids.len()).is_some() {
        return Err(WorkflowError::DuplicateStep {
          step_id: id.to_string(),
        });
      }
      ids.push(id.to_string());
    }

    let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (i, (id, deps)) in steps.iter().enumerate() {
      for dep in deps {
        let Some(&dep_index) = index.get(*dep) else {
          return Err(WorkflowError::UnknownDependency {
            step_id: id.to_string(),
            dependency: dep.to_string(),
          });
        };
        if !upstream[i].contains(&dep_index) {
          upstream[i].push(dep_index);
        }
      }
    }

    if let Some(cycle) = find_cycle(&upstream) {
      return Err(WorkflowError::CyclicDependency {
        cycle: cycle.into_iter().map(|i| ids[i].clone()).collect(),
      });
    }

    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (i, deps) in upstream.iter().enumerate() {
      for &dep in deps {
        downstream[dep].push(i);
      }
    }

    let entry_points = (0..ids.len()).filter(|&i| upstream[i].is_empty()).collect();
    let topological_order = topological_order(&upstream, &downstream);

    Ok(Self {
      ids,
      index,
      upstream,
      downstream,
      entry_points,
      topological_order,
    })
  }

  /// Number of steps.
  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  /// Step ids in insertion order.
  pub fn ids(&self) -> &[String] {
    &self.ids
  }

  /// Step id at the given insertion index.
  pub fn id(&self, index: usize) -> &str {
    &self.ids[index]
  }

  /// Look up a step's insertion index.
  pub fn index_of(&self, step_id: &str) -> Option<usize> {
    self.index.get(step_id).copied()
  }

  /// Direct dependencies of a step.
  pub fn upstream(&self, index: usize) -> &[usize] {
    &self.upstream[index]
  }

  /// Direct dependents of a step.
  pub fn downstream(&self, index: usize) -> &[usize] {
    &self.downstream[index]
  }

  /// Ids of the steps the given step depends on.
  pub fn dependencies_of(&self, step_id: &str) -> Vec<&str> {
    self
      .index_of(step_id)
      .map(|i| self.upstream[i].iter().map(|&d| self.id(d)).collect())
      .unwrap_or_default()
  }

  /// Ids of the steps that depend directly on the given step.
  pub fn dependents_of(&self, step_id: &str) -> Vec<&str> {
    self
      .index_of(step_id)
      .map(|i| self.downstream[i].iter().map(|&d| self.id(d)).collect())
      .unwrap_or_default()
  }

  /// Steps with no dependencies.
  pub fn entry_points(&self) -> &[usize] {
    &self.entry_points
  }

  /// Insertion indices in a valid execution order.
  pub fn topological_order(&self) -> &[usize] {
    &self.topological_order
  }

  /// Step ids in a valid execution order.
  pub fn topological_ids(&self) -> Vec<&str> {
    self
      .topological_order
      .iter()
      .map(|&i| self.id(i))
      .collect()
  }

  /// Every step that directly or transitively depends on `index`, ascending.
  pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<usize> = self.downstream[index].iter().copied().collect();

    while let Some(next) = queue.pop_front() {
      if seen.insert(next) {
        queue.extend(self.downstream[next].iter().copied());
      }
    }

    seen.into_iter().collect()
  }
}

/// Depth-first search with temporary/permanent marks. A dependency edge that
/// reaches a temporarily marked step closes a cycle; the returned path starts
/// and ends on that step.
///
/// The walk keeps its own stack of `(step, next dependency)` frames so deep
/// chains do not grow the call stack.
fn find_cycle(upstream: &[Vec<usize>]) -> Option<Vec<usize>> {
  #[derive(Clone, Copy, PartialEq)]
  enum Mark {
    Unvisited,
    Temporary,
    Permanent,
  }

  let mut marks = vec![Mark::Unvisited; upstream.len()];
  let mut stack: Vec<(usize, usize)> = Vec::new();

  for root in 0..upstream.len() {
    if marks[root] != Mark::Unvisited {
      continue;
    }
    marks[root] = Mark::Temporary;
    stack.push((root, 0));

    while let Some(frame) = stack.last_mut() {
      let (node, next) = *frame;
      let Some(&dep) = upstream[node].get(next) else {
        marks[node] = Mark::Permanent;
        stack.pop();
        continue;
      };
      frame.1 += 1;

      match marks[dep] {
        Mark::Temporary => {
          let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
          let mut cycle: Vec<usize> = stack[start..].iter().map(|&(n, _)| n).collect();
          cycle.push(dep);
          return Some(cycle);
        }
        Mark::Unvisited => {
          marks[dep] = Mark::Temporary;
          stack.push((dep, 0));
        }
        Mark::Permanent => {}
      }
    }
  }

  None
}

/// Kahn's algorithm over an acyclic graph, always taking the lowest ready index.
fn topological_order(upstream: &[Vec<usize>], downstream: &[Vec<usize>]) -> Vec<usize> {
  let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
  let mut ready: BTreeSet<usize> = (0..upstream.len())
    .filter(|&i| in_degree[i] == 0)
    .collect();
  let mut order = Vec::with_capacity(upstream.len());

  while let Some(next) = ready.pop_first() {
    order.push(next);
    for &dependent in &downstream[next] {
      in_degree[dependent] -= 1;
      if in_degree[dependent] == 0 {
        ready.insert(dependent);
      }
    }
  }

  order
}

#[cfg(test)]
mod tests {
  use super::*;

  fn graph(steps: &[(&'static str, &[&'static str])]) -> Result<Graph, WorkflowError> {
    Graph::new(steps.iter().map(|(id, deps)| (*id, deps.iter().copied())))
  }

  #[test]
  fn test_linear_chain() {
    let g = graph(&[
      ("validate", &[]),
      ("process", &["validate"]),
      ("notify", &["process"]),
    ])
    .unwrap();

    assert_eq!(g.len(), 3);
    assert_eq!(g.entry_points(), &[0]);
    assert_eq!(g.topological_ids(), vec!["validate", "process", "notify"]);
    assert_eq!(g.dependencies_of("notify"), vec!["process"]);
    assert_eq!(g.dependents_of("validate"), vec!["process"]);
  }

  #[test]
  fn test_topological_order_breaks_ties_by_insertion() {
    let g = graph(&[
      ("report", &["fetch_b", "fetch_a"]),
      ("fetch_b", &[]),
      ("fetch_a", &[]),
    ])
    .unwrap();

    assert_eq!(g.topological_ids(), vec!["fetch_b", "fetch_a", "report"]);
    assert_eq!(g.entry_points(), &[1, 2]);
  }

  #[test]
  fn test_duplicate_dependencies_are_collapsed() {
    let g = graph(&[("a", &[]), ("b", &["a", "a"])]).unwrap();
    assert_eq!(g.upstream(1), &[0]);
    assert_eq!(g.downstream(0), &[1]);
  }

  #[test]
  fn test_duplicate_step_id() {
    let err = graph(&[("a", &[]), ("a", &[])]).unwrap_err();
    assert_eq!(
      err,
      WorkflowError::DuplicateStep {
        step_id: "a".to_string()
      }
    );
  }

  #[test]
  fn test_empty_step_id() {
    let err = graph(&[("", &[])]).unwrap_err();
    assert_eq!(err, WorkflowError::EmptyStepId);
  }

  #[test]
  fn test_unknown_dependency() {
    let err = graph(&[("a", &[]), ("b", &["missing"])]).unwrap_err();
    assert_eq!(
      err,
      WorkflowError::UnknownDependency {
        step_id: "b".to_string(),
        dependency: "missing".to_string(),
      }
    );
  }

  #[test]
  fn test_three_step_cycle() {
    let err = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]).unwrap_err();
    match err {
      WorkflowError::CyclicDependency { cycle } => {
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
      }
      other => panic!("expected cycle, got {other:?}"),
    }
  }

  #[test]
  fn test_self_dependency_is_a_cycle() {
    let err = graph(&[("a", &["a"])]).unwrap_err();
    assert!(matches!(err, WorkflowError::CyclicDependency { cycle } if cycle == vec!["a", "a"]));
  }

  #[test]
  fn test_cycle_error_message() {
    let err = graph(&[("a", &["b"]), ("b", &["a"])]).unwrap_err();
    assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
  }

  #[test]
  fn test_diamond_is_not_a_cycle() {
    let g = graph(&[
      ("root", &[]),
      ("left", &["root"]),
      ("right", &["root"]),
      ("join", &["left", "right"]),
    ])
    .unwrap();

    assert_eq!(g.topological_ids(), vec!["root", "left", "right", "join"]);
    assert_eq!(g.transitive_dependents(0), vec![1, 2, 3]);
    assert_eq!(g.transitive_dependents(1), vec![3]);
    assert!(g.transitive_dependents(3).is_empty());
  }

  #[test]
  fn test_deep_chain_inserted_dependents_first() {
    // s0 depends on s1, s1 on s2, and so on.
    let ids: Vec<String> = (0..50_000).map(|i| format!("s{i}")).collect();
    let g = Graph::new(
      ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), ids.get(i + 1).map(String::as_str))),
    )
    .unwrap();

    assert_eq!(g.len(), 50_000);
    assert_eq!(g.entry_points(), &[49_999]);
    assert_eq!(g.topological_order().first(), Some(&49_999));
    assert_eq!(g.topological_order().last(), Some(&0));
  }

  #[test]
  fn test_deep_cycle_is_reported() {
    let ids: Vec<String> = (0..50_000).map(|i| format!("s{i}")).collect();
    let err = Graph::new(ids.iter().enumerate().map(|(i, id)| {
      let dep = ids.get(i + 1).unwrap_or(&ids[0]);
      (id.as_str(), Some(dep.as_str()))
    }))
    .unwrap_err();

    match err {
      WorkflowError::CyclicDependency { cycle } => {
        assert_eq!(cycle.len(), 50_001);
        assert_eq!(cycle.first().map(String::as_str), Some("s0"));
        assert_eq!(cycle.last().map(String::as_str), Some("s0"));
      }
      other => panic!("expected cycle, got {other:?}"),
    }
  }

  #[test]
  fn test_empty_graph() {
    let g = graph(&[]).unwrap();
    assert!(g.is_empty());
    assert!(g.topological_order().is_empty());
  }
}
