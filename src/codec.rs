//! Version-gated wire encoding.
//!
//! Every message travels inside an `Envelope` that declares the protocol
//! version it was written for. Fields introduced after that version are
//! stripped on encode and ignored on decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireVersion(pub u32);

impl WireVersion {
  pub const V1: WireVersion = WireVersion(1);
  pub const V2: WireVersion = WireVersion(2);
  pub const V3: WireVersion = WireVersion(3);

  pub const MINIMUM: WireVersion = WireVersion::V1;
  pub const CURRENT: WireVersion = WireVersion::V3;

  /// `tenant_id` on tasks and envelopes.
  pub const TENANT_ID: WireVersion = WireVersion::V2;
  /// `ForwardInput::notify_nodes`.
  pub const FORWARD_NOTIFY_NODES: WireVersion = WireVersion::V3;

  pub fn supports(self, feature: WireVersion) -> bool {
    self >= feature
  }

  /// The version two peers can both speak.
  pub fn negotiate(self, peer: WireVersion) -> WireVersion {
    self.min(peer)
  }
}

/// Implemented by every type that crosses the wire.
pub trait Versioned {
  /// Drops whatever `version` does not know about.
  fn retain_for(&mut self, version: WireVersion);

  fn tenant_id(&self) -> Option<String> {
    None
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub version: WireVersion,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tenant_id: Option<String>,
  pub body: T,
}

pub fn encode<T>(body: &T, peer: WireVersion) -> Result<Vec<u8>, CodecError>
where
  T: Serialize + Versioned + Clone,
{
  let version = WireVersion::CURRENT.negotiate(peer);
  if version < WireVersion::MINIMUM {
    return Err(CodecError::UnsupportedVersion(version.0));
  }
  let mut body = body.clone();
  body.retain_for(version);
  let tenant_id = if version.supports(WireVersion::TENANT_ID) { body.tenant_id() } else { None };
  let envelope = Envelope { version, tenant_id, body };
  Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode<T>(bytes: &[u8]) -> Result<Envelope<T>, CodecError>
where
  T: DeserializeOwned + Versioned,
{
  let mut envelope: Envelope<T> = serde_json::from_slice(bytes)?;
  if envelope.version < WireVersion::MINIMUM {
    return Err(CodecError::UnsupportedVersion(envelope.version.0));
  }
  // A newer peer may send fields we do not know; serde already skipped them.
  let effective = envelope.version.min(WireVersion::CURRENT);
  envelope.body.retain_for(effective);
  if !effective.supports(WireVersion::TENANT_ID) {
    envelope.tenant_id = None;
  }
  Ok(envelope)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregator::aggregate;
  use crate::dispatch::{NodeResponse, NodesResponse};
  use crate::error::NodeError;
  use crate::models::{FunctionName, NodeId, Task, TaskId, TaskSpec, TaskType};
  use crate::protocol::{ClusterMessage, ForwardInput, LoadModelInput, LoadSuccess, ModelNodeStatus};
  use crate::task_registry::TaskRegistry;
  use std::collections::BTreeMap;

  fn tenant_task() -> Task {
    let registry = TaskRegistry::new();
    registry.create(
      TaskSpec::new(FunctionName::TextEmbedding, TaskType::LoadModel)
        .model("m1")
        .dispatched(true)
        .asynchronous(true)
        .tenant(Some("tenant-7".into())),
    )
  }

  fn load_input() -> LoadModelInput {
    let task = tenant_task();
    LoadModelInput {
      model_id: "m1".into(),
      task_id: task.task_id.clone(),
      model_content_hash: "abc123".into(),
      node_count: 3,
      coordinating_node_id: NodeId::from("coord"),
      task,
    }
  }

  fn forward_input() -> ForwardInput {
    let mut input = ForwardInput::load_done(
      TaskId::from("t1"),
      "m1",
      NodeId::from("a"),
      Ok(LoadSuccess { content_hash: "abc123".into() }),
    );
    input.task = Some(tenant_task());
    input.model_input = Some(serde_json::json!({"batch": 2}));
    input.notify_nodes = Some(vec![NodeId::from("b"), NodeId::from("c")]);
    input
  }

  #[test]
  fn load_input_round_trips_at_current_version() {
    let message = ClusterMessage::LoadModel(load_input());
    let bytes = encode(&message, WireVersion::CURRENT).unwrap();
    let envelope: Envelope<ClusterMessage> = decode(&bytes).unwrap();

    assert_eq!(envelope.version, WireVersion::CURRENT);
    assert_eq!(envelope.tenant_id.as_deref(), Some("tenant-7"));
    assert_eq!(envelope.body, message);
  }

  #[test]
  fn forward_input_round_trips_with_every_optional_field() {
    let message = ClusterMessage::Forward(forward_input());
    let bytes = encode(&message, WireVersion::CURRENT).unwrap();
    let envelope: Envelope<ClusterMessage> = decode(&bytes).unwrap();
    assert_eq!(envelope.body, message);
  }

  #[test]
  fn older_peer_never_sees_newer_fields() {
    let message = ClusterMessage::Forward(forward_input());

    let v2: Envelope<ClusterMessage> = decode(&encode(&message, WireVersion::V2).unwrap()).unwrap();
    let ClusterMessage::Forward(at_v2) = v2.body else { panic!("wrong variant") };
    assert_eq!(v2.version, WireVersion::V2);
    assert!(at_v2.notify_nodes.is_none());
    assert_eq!(at_v2.task.as_ref().unwrap().tenant_id.as_deref(), Some("tenant-7"));

    let v1: Envelope<ClusterMessage> = decode(&encode(&message, WireVersion::V1).unwrap()).unwrap();
    let ClusterMessage::Forward(at_v1) = v1.body else { panic!("wrong variant") };
    assert!(v1.tenant_id.is_none());
    assert!(at_v1.task.as_ref().unwrap().tenant_id.is_none());

    let mut expected = forward_input();
    expected.notify_nodes = None;
    expected.task.as_mut().unwrap().tenant_id = None;
    assert_eq!(at_v1, expected);
  }

  #[test]
  fn decode_ignores_fields_beyond_the_declared_version() {
    let mut value = serde_json::to_value(Envelope {
      version: WireVersion::CURRENT,
      tenant_id: Some("tenant-7".to_string()),
      body: ClusterMessage::Forward(forward_input()),
    })
    .unwrap();
    value["version"] = serde_json::json!(1);
    let bytes = serde_json::to_vec(&value).unwrap();

    let envelope: Envelope<ClusterMessage> = decode(&bytes).unwrap();
    let ClusterMessage::Forward(input) = envelope.body else { panic!("wrong variant") };
    assert!(envelope.tenant_id.is_none());
    assert!(input.notify_nodes.is_none());
  }

  #[test]
  fn nodes_response_round_trips() {
    let report: NodesResponse<ModelNodeStatus> = aggregate(
      "ml-cluster",
      vec![
        NodeResponse {
          node_id: NodeId::from("a"),
          outcome: Ok(ModelNodeStatus {
            node_id: NodeId::from("a"),
            statuses: BTreeMap::from([("m1".to_string(), "unloaded".to_string())]),
          }),
        },
        NodeResponse {
          node_id: NodeId::from("b"),
          outcome: Err(NodeError::Timeout { node_id: NodeId::from("b"), after_ms: 500 }),
        },
      ],
    );

    let bytes = encode(&report, WireVersion::V1).unwrap();
    let envelope: Envelope<NodesResponse<ModelNodeStatus>> = decode(&bytes).unwrap();
    assert_eq!(envelope.body, report);
  }

  #[test]
  fn version_zero_is_rejected() {
    let bytes = br#"{"version":0,"body":{"type":"unload_model","body":{"model_ids":["m1"]}}}"#;
    let err = decode::<ClusterMessage>(bytes).unwrap_err();
    assert!(matches!(err, CodecError::UnsupportedVersion(0)));
  }

  #[test]
  fn garbage_is_malformed() {
    let err = decode::<ClusterMessage>(b"not json").unwrap_err();
    assert!(matches!(err, CodecError::Malformed(_)));
  }
}
