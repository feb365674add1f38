//! Seams between the coordination core and the outside world: how a message
//! reaches another node, how a node answers, and who is in the cluster.

use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::codec::{self, Envelope, WireVersion};
use crate::error::NodeError;
use crate::models::NodeId;
use crate::protocol::{ClusterMessage, ClusterReply};

pub trait Transport: Send + Sync {
  fn send(&self, node_id: &NodeId, message: ClusterMessage) -> BoxFuture<'_, Result<ClusterReply, NodeError>>;
}

pub trait MessageHandler: Send + Sync {
  fn on_message(&self, message: ClusterMessage) -> BoxFuture<'_, ClusterReply>;
}

pub trait Membership: Send + Sync {
  fn local_node(&self) -> NodeId;
  fn live_nodes(&self) -> Vec<NodeId>;
  fn cluster_name(&self) -> String;
}

/// Fixed node list, read once from configuration.
#[derive(Debug, Clone)]
pub struct StaticMembership {
  local: NodeId,
  nodes: Vec<NodeId>,
  cluster_name: String,
}

impl StaticMembership {
  pub fn new(local: NodeId, nodes: Vec<NodeId>, cluster_name: impl Into<String>) -> Self {
    let mut nodes = nodes;
    if !nodes.contains(&local) {
      nodes.push(local.clone());
    }
    nodes.sort();
    nodes.dedup();
    Self { local, nodes, cluster_name: cluster_name.into() }
  }
}

impl Membership for StaticMembership {
  fn local_node(&self) -> NodeId {
    self.local.clone()
  }

  fn live_nodes(&self) -> Vec<NodeId> {
    self.nodes.clone()
  }

  fn cluster_name(&self) -> String {
    self.cluster_name.clone()
  }
}

struct LocalNode {
  handler: Arc<dyn MessageHandler>,
  version: WireVersion,
  online: bool,
}

/// In-process cluster. Every message still goes through the wire codec at the
/// receiving node's protocol version, so version gating behaves as it would
/// across a real network. A node taken offline never answers.
pub struct LocalCluster {
  cluster_name: String,
  nodes: DashMap<NodeId, LocalNode>,
}

impl LocalCluster {
  pub fn new(cluster_name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self { cluster_name: cluster_name.into(), nodes: DashMap::new() })
  }

  pub fn join(&self, node_id: NodeId, handler: Arc<dyn MessageHandler>, version: WireVersion) {
    tracing::info!("Node {} joined {} at wire version {}", node_id, self.cluster_name, version.0);
    self.nodes.insert(node_id, LocalNode { handler, version, online: true });
  }

  pub fn set_online(&self, node_id: &NodeId, online: bool) {
    if let Some(mut node) = self.nodes.get_mut(node_id) {
      node.online = online;
      tracing::info!("Node {} is now {}", node_id, if online { "online" } else { "offline" });
    }
  }

  pub fn membership(self: &Arc<Self>, local: NodeId) -> LocalMembership {
    LocalMembership { cluster: self.clone(), local }
  }

  fn round_trip(
    message: &ClusterMessage,
    version: WireVersion,
  ) -> Result<ClusterMessage, NodeError> {
    let bytes = codec::encode(message, version).map_err(|e| NodeError::protocol(e.to_string()))?;
    let envelope: Envelope<ClusterMessage> =
      codec::decode(&bytes).map_err(|e| NodeError::protocol(e.to_string()))?;
    Ok(envelope.body)
  }
}

impl Transport for LocalCluster {
  fn send(&self, node_id: &NodeId, message: ClusterMessage) -> BoxFuture<'_, Result<ClusterReply, NodeError>> {
    let target = self
      .nodes
      .get(node_id)
      .map(|node| (node.handler.clone(), node.version, node.online));
    let node_id = node_id.clone();

    async move {
      let Some((handler, version, online)) = target else {
        return Err(NodeError::transport(format!("node {} is not part of the cluster", node_id)));
      };
      if !online {
        tracing::debug!("Dropping {} for offline node {}", message.name(), node_id);
        futures::future::pending::<()>().await;
      }
      let delivered = Self::round_trip(&message, version)?;
      let reply = handler.on_message(delivered).await;
      let bytes = codec::encode(&reply, version).map_err(|e| NodeError::protocol(e.to_string()))?;
      let envelope: Envelope<ClusterReply> =
        codec::decode(&bytes).map_err(|e| NodeError::protocol(e.to_string()))?;
      Ok(envelope.body)
    }
    .boxed()
  }
}

#[derive(Clone)]
pub struct LocalMembership {
  cluster: Arc<LocalCluster>,
  local: NodeId,
}

impl Membership for LocalMembership {
  fn local_node(&self) -> NodeId {
    self.local.clone()
  }

  fn live_nodes(&self) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = self
      .cluster
      .nodes
      .iter()
      .filter(|node| node.online)
      .map(|node| node.key().clone())
      .collect();
    nodes.sort();
    nodes
  }

  fn cluster_name(&self) -> String {
    self.cluster.cluster_name.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{ModelNodeStatus, STATUS_NOT_FOUND, UnloadModelInput};
  use std::collections::BTreeMap;
  use std::time::Duration;

  struct Echo(NodeId);

  impl MessageHandler for Echo {
    fn on_message(&self, message: ClusterMessage) -> BoxFuture<'_, ClusterReply> {
      async move {
        match message {
          ClusterMessage::UnloadModel(input) => ClusterReply::ModelStatus(ModelNodeStatus {
            node_id: self.0.clone(),
            statuses: input.model_ids.into_iter().map(|m| (m, STATUS_NOT_FOUND.to_string())).collect(),
          }),
          _ => ClusterReply::Ack,
        }
      }
      .boxed()
    }
  }

  fn unload() -> ClusterMessage {
    ClusterMessage::UnloadModel(UnloadModelInput { model_ids: vec!["m1".into()] })
  }

  #[tokio::test]
  async fn local_cluster_routes_through_handler() {
    let cluster = LocalCluster::new("c");
    let a = NodeId::from("a");
    cluster.join(a.clone(), Arc::new(Echo(a.clone())), WireVersion::V1);

    let reply = cluster.send(&a, unload()).await.unwrap();
    let expected = ModelNodeStatus {
      node_id: a.clone(),
      statuses: BTreeMap::from([("m1".to_string(), "not_found".to_string())]),
    };
    assert_eq!(reply, ClusterReply::ModelStatus(expected));
  }

  #[tokio::test]
  async fn unknown_node_is_a_transport_error() {
    let cluster = LocalCluster::new("c");
    let err = cluster.send(&NodeId::from("ghost"), unload()).await.unwrap_err();
    assert!(matches!(err, NodeError::Transport { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn offline_node_never_answers() {
    let cluster = LocalCluster::new("c");
    let b = NodeId::from("b");
    cluster.join(b.clone(), Arc::new(Echo(b.clone())), WireVersion::CURRENT);
    cluster.set_online(&b, false);

    let outcome = tokio::time::timeout(Duration::from_secs(1), cluster.send(&b, unload())).await;
    assert!(outcome.is_err());
    assert!(cluster.membership(b.clone()).live_nodes().is_empty());
  }

  #[test]
  fn static_membership_always_includes_local_node() {
    let membership = StaticMembership::new(NodeId::from("b"), vec![NodeId::from("a"), NodeId::from("a")], "c");
    assert_eq!(membership.live_nodes(), vec![NodeId::from("a"), NodeId::from("b")]);
    assert_eq!(membership.cluster_name(), "c");
  }
}
