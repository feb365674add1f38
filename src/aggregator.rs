//! Turns raw per-node outcomes into a partial-failure report and decides the
//! terminal state of the task that produced them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dispatch::{NodeFailure, NodeResponse, NodeSuccess, NodesResponse};
use crate::models::{NodeId, TaskState};

/// How many node failures an operation tolerates. Callers always pick one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "nodes", rename_all = "snake_case")]
pub enum CompletionPolicy {
  /// Completed only when no node failed.
  AllNodes,
  /// Completed when every listed node succeeded; other nodes may fail.
  Required(BTreeSet<NodeId>),
}

pub fn aggregate<R>(cluster_name: &str, outcomes: Vec<NodeResponse<R>>) -> NodesResponse<R> {
  let mut successes = Vec::new();
  let mut failures = Vec::new();
  for response in outcomes {
    match response.outcome {
      Ok(value) => successes.push(NodeSuccess { node_id: response.node_id, value }),
      Err(cause) => failures.push(NodeFailure { node_id: response.node_id, cause }),
    }
  }
  NodesResponse { cluster_name: cluster_name.to_string(), successes, failures }
}

impl<R> NodesResponse<R> {
  pub fn node_count(&self) -> usize {
    self.successes.len() + self.failures.len()
  }

  pub fn has_failures(&self) -> bool {
    !self.failures.is_empty()
  }

  pub fn succeeded(&self, node_id: &NodeId) -> bool {
    self.successes.iter().any(|s| &s.node_id == node_id)
  }

  pub fn success_nodes(&self) -> Vec<NodeId> {
    self.successes.iter().map(|s| s.node_id.clone()).collect()
  }

  pub fn terminal_state(&self, policy: &CompletionPolicy) -> TaskState {
    let completed = match policy {
      CompletionPolicy::AllNodes => !self.has_failures(),
      CompletionPolicy::Required(required) => required.iter().all(|node| self.succeeded(node)),
    };
    if completed { TaskState::Completed } else { TaskState::Failed }
  }

  /// One line per failed node, used as the task's error text.
  pub fn failure_summary(&self) -> Option<String> {
    if !self.has_failures() {
      return None;
    }
    let errors: BTreeMap<&str, String> = self
      .failures
      .iter()
      .map(|f| (f.node_id.0.as_str(), f.cause.to_string()))
      .collect();
    serde_json::to_string(&errors).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::NodeError;

  fn response(node: &str, outcome: Result<&'static str, NodeError>) -> NodeResponse<&'static str> {
    NodeResponse { node_id: NodeId::from(node), outcome }
  }

  #[test]
  fn every_outcome_lands_in_one_list() {
    let report = aggregate(
      "ml-cluster",
      vec![
        response("a", Ok("unloaded")),
        response("b", Err(NodeError::transport("connection reset"))),
        response("c", Ok("not_found")),
      ],
    );

    assert_eq!(report.node_count(), 3);
    assert_eq!(report.successes.len(), 2);
    assert_eq!(report.failures[0].node_id, NodeId::from("b"));
    assert_eq!(report.cluster_name, "ml-cluster");
  }

  #[test]
  fn all_failed_is_an_empty_success_list_not_an_error() {
    let report = aggregate::<&str>("c", vec![response("a", Err(NodeError::engine("x")))]);
    assert!(report.successes.is_empty());
    assert_eq!(report.terminal_state(&CompletionPolicy::AllNodes), TaskState::Failed);
  }

  #[test]
  fn policy_decides_partial_failure() {
    let report = aggregate(
      "c",
      vec![response("a", Ok("unloaded")), response("b", Err(NodeError::transport("down")))],
    );

    assert_eq!(report.terminal_state(&CompletionPolicy::AllNodes), TaskState::Failed);
    let only_a = CompletionPolicy::Required(BTreeSet::from([NodeId::from("a")]));
    assert_eq!(report.terminal_state(&only_a), TaskState::Completed);
    let needs_b = CompletionPolicy::Required(BTreeSet::from([NodeId::from("b")]));
    assert_eq!(report.terminal_state(&needs_b), TaskState::Failed);
  }

  #[test]
  fn failure_summary_names_each_node() {
    let report = aggregate::<&str>("c", vec![response("b", Err(NodeError::transport("down")))]);
    let summary = report.failure_summary().unwrap();
    assert!(summary.contains("\"b\""));
    assert!(summary.contains("down"));
  }
}
