//! Scatter-gather envelope.
//!
//! One cluster-wide request fans out into per-node requests; every node's
//! outcome, success or failure, comes back as exactly one `NodeResponse`.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::models::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesRequest<P> {
  pub node_ids: Vec<NodeId>,
  pub payload: P,
}

impl<P: Clone> NodesRequest<P> {
  /// Duplicate targets collapse so each node owns exactly one slice.
  pub fn new(node_ids: impl IntoIterator<Item = NodeId>, payload: P) -> Self {
    let mut seen = HashSet::new();
    let node_ids = node_ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
    Self { node_ids, payload }
  }

  pub fn split(&self) -> Vec<NodeRequest<P>> {
    self
      .node_ids
      .iter()
      .map(|node_id| NodeRequest { node_id: node_id.clone(), payload: self.payload.clone() })
      .collect()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest<P> {
  pub node_id: NodeId,
  pub payload: P,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResponse<R> {
  pub node_id: NodeId,
  pub outcome: Result<R, NodeError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSuccess<R> {
  pub node_id: NodeId,
  pub value: R,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
  pub node_id: NodeId,
  pub cause: NodeError,
}

/// Coordinator-side aggregate. Every targeted node is in exactly one list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesResponse<R> {
  pub cluster_name: String,
  pub successes: Vec<NodeSuccess<R>>,
  pub failures: Vec<NodeFailure>,
}

/// Runs `handler` once per target, concurrently, each call bounded by
/// `node_timeout`. A node that errors, panics or times out only affects its
/// own response. Responses come back in no particular order.
pub async fn dispatch<P, R, F, Fut>(
  request: NodesRequest<P>,
  node_timeout: Duration,
  handler: F,
) -> Vec<NodeResponse<R>>
where
  P: Clone + Send + 'static,
  R: Send + 'static,
  F: Fn(NodeRequest<P>) -> Fut + Clone + Send + 'static,
  Fut: Future<Output = Result<R, NodeError>> + Send + 'static,
{
  let calls: Vec<_> = request
    .split()
    .into_iter()
    .map(|node_request| {
      let node_id = node_request.node_id.clone();
      let handler = handler.clone();
      let call = tokio::spawn(async move {
        let target = node_request.node_id.clone();
        match tokio::time::timeout(node_timeout, handler(node_request)).await {
          Ok(outcome) => outcome,
          Err(_) => Err(NodeError::Timeout {
            node_id: target,
            after_ms: node_timeout.as_millis() as u64,
          }),
        }
      });
      (node_id, call)
    })
    .collect();

  let (node_ids, handles): (Vec<_>, Vec<_>) = calls.into_iter().unzip();
  let joined = futures::future::join_all(handles).await;

  node_ids
    .into_iter()
    .zip(joined)
    .map(|(node_id, joined)| {
      let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
          tracing::error!("Handler for node {} did not finish: {}", node_id, e);
          Err(NodeError::handler(format!("node handler aborted: {}", e)))
        }
      };
      if let Err(cause) = &outcome {
        tracing::warn!("Node {} failed: {}", node_id, cause);
      }
      NodeResponse { node_id, outcome }
    })
    .collect()
}
