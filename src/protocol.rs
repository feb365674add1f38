//! Messages exchanged between coordinating and worker nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Versioned, WireVersion};
use crate::dispatch::NodesResponse;
use crate::error::{NodeError, ProtocolError};
use crate::models::{FunctionName, ModelId, NodeId, Task, TaskId, TaskType};

pub const STATUS_RECEIVED: &str = "received";
pub const STATUS_LOADED: &str = "loaded";
pub const STATUS_UNLOADED: &str = "unloaded";
pub const STATUS_NOT_FOUND: &str = "not_found";
pub const FORWARD_OK: &str = "ok";
pub const FORWARD_IGNORED: &str = "ignored";
pub const STATUS_ERROR_PREFIX: &str = "error:";

pub fn error_status(detail: impl std::fmt::Display) -> String {
  format!("{}{}", STATUS_ERROR_PREFIX, detail)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelInput {
  pub model_id: ModelId,
  pub task_id: TaskId,
  pub model_content_hash: String,
  pub node_count: usize,
  pub coordinating_node_id: NodeId,
  pub task: Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardRequestType {
  LoadModelDone,
  UploadModel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSuccess {
  pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadModelInput {
  pub model_id: ModelId,
  pub name: String,
  pub version: String,
  pub function_name: FunctionName,
  pub content_hash: String,
  pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardInput {
  pub task_id: TaskId,
  pub model_id: ModelId,
  pub worker_node_id: NodeId,
  pub request_kind: ForwardRequestType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task: Option<Task>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model_input: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<NodeError>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub success: Option<LoadSuccess>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notify_nodes: Option<Vec<NodeId>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upload_input: Option<UploadModelInput>,
}

impl ForwardInput {
  pub fn load_done(
    task_id: TaskId,
    model_id: impl Into<ModelId>,
    worker_node_id: NodeId,
    outcome: Result<LoadSuccess, NodeError>,
  ) -> Self {
    let (success, error) = match outcome {
      Ok(success) => (Some(success), None),
      Err(error) => (None, Some(error)),
    };
    Self {
      task_id,
      model_id: model_id.into(),
      worker_node_id,
      request_kind: ForwardRequestType::LoadModelDone,
      task: None,
      model_input: None,
      error,
      success,
      notify_nodes: None,
      upload_input: None,
    }
  }

  pub fn upload(task_id: TaskId, worker_node_id: NodeId, upload: UploadModelInput, config: Option<Value>) -> Self {
    Self {
      task_id,
      model_id: upload.model_id.clone(),
      worker_node_id,
      request_kind: ForwardRequestType::UploadModel,
      task: None,
      model_input: config,
      error: None,
      success: None,
      notify_nodes: None,
      upload_input: Some(upload),
    }
  }

  /// Rejects messages whose meaning would otherwise have to be guessed.
  pub fn validate(&self) -> Result<(), ProtocolError> {
    match self.request_kind {
      ForwardRequestType::LoadModelDone => match (&self.error, &self.success) {
        (None, None) => Err(ProtocolError::InvalidForward(format!(
          "LOAD_MODEL_DONE from {} for task {} carries neither error nor success",
          self.worker_node_id, self.task_id
        ))),
        (Some(_), Some(_)) => Err(ProtocolError::InvalidForward(format!(
          "LOAD_MODEL_DONE from {} for task {} carries both error and success",
          self.worker_node_id, self.task_id
        ))),
        _ => Ok(()),
      },
      ForwardRequestType::UploadModel => match &self.upload_input {
        Some(upload) if upload.model_id == self.model_id => Ok(()),
        Some(upload) => Err(ProtocolError::InvalidForward(format!(
          "UPLOAD_MODEL model id {} does not match upload input {}",
          self.model_id, upload.model_id
        ))),
        None => Err(ProtocolError::InvalidForward("UPLOAD_MODEL without upload input".into())),
      },
    }
  }

  /// The worker's reported outcome. Only meaningful after `validate`.
  pub fn outcome(&self) -> Result<LoadSuccess, NodeError> {
    match (&self.success, &self.error) {
      (Some(success), None) => Ok(success.clone()),
      (_, Some(error)) => Err(error.clone()),
      (None, None) => Err(NodeError::protocol("forward carries no outcome")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
  pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadModelInput {
  pub model_ids: Vec<ModelId>,
}

/// Per-node status map: model id -> status string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNodeStatus {
  pub node_id: NodeId,
  pub statuses: BTreeMap<ModelId, String>,
}

impl ModelNodeStatus {
  /// A node that reported `error:` for any model failed the request as a whole.
  pub fn into_outcome(self) -> Result<Self, NodeError> {
    let errors: Vec<String> = self
      .statuses
      .iter()
      .filter_map(|(model_id, status)| {
        status
          .strip_prefix(STATUS_ERROR_PREFIX)
          .map(|detail| format!("{}: {}", model_id, detail))
      })
      .collect();
    if errors.is_empty() { Ok(self) } else { Err(NodeError::engine(errors.join("; "))) }
  }
}

/// model id -> node id -> status, across the whole cluster.
pub type ClusterModelStatus = BTreeMap<ModelId, BTreeMap<NodeId, String>>;

pub fn merge_statuses(report: &NodesResponse<ModelNodeStatus>) -> ClusterModelStatus {
  let mut merged = ClusterModelStatus::new();
  for success in &report.successes {
    for (model_id, status) in &success.value.statuses {
      merged
        .entry(model_id.clone())
        .or_default()
        .insert(success.node_id.clone(), status.clone());
    }
  }
  merged
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
  pub task_id: TaskId,
  pub function_name: FunctionName,
  pub task_type: TaskType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model_id: Option<ModelId>,
  pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutput {
  pub node_id: NodeId,
  pub output: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUpInput {
  #[serde(default)]
  pub added_worker_nodes: BTreeMap<ModelId, Vec<NodeId>>,
  #[serde(default)]
  pub removed_worker_nodes: BTreeMap<ModelId, Vec<NodeId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ClusterMessage {
  LoadModel(LoadModelInput),
  UnloadModel(UnloadModelInput),
  Execute(ExecuteInput),
  Forward(ForwardInput),
  SyncUp(SyncUpInput),
}

impl ClusterMessage {
  pub fn name(&self) -> &'static str {
    match self {
      ClusterMessage::LoadModel(_) => "load_model",
      ClusterMessage::UnloadModel(_) => "unload_model",
      ClusterMessage::Execute(_) => "execute",
      ClusterMessage::Forward(_) => "forward",
      ClusterMessage::SyncUp(_) => "sync_up",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ClusterReply {
  ModelStatus(ModelNodeStatus),
  Output(ExecuteOutput),
  Forwarded(ForwardResponse),
  Ack,
  Error(NodeError),
}

impl Versioned for Task {
  fn retain_for(&mut self, version: WireVersion) {
    if !version.supports(WireVersion::TENANT_ID) {
      self.tenant_id = None;
    }
  }

  fn tenant_id(&self) -> Option<String> {
    self.tenant_id.clone()
  }
}

impl Versioned for ForwardInput {
  fn retain_for(&mut self, version: WireVersion) {
    if let Some(task) = self.task.as_mut() {
      task.retain_for(version);
    }
    if !version.supports(WireVersion::FORWARD_NOTIFY_NODES) {
      self.notify_nodes = None;
    }
  }

  fn tenant_id(&self) -> Option<String> {
    self.task.as_ref().and_then(|task| task.tenant_id.clone())
  }
}

impl Versioned for ClusterMessage {
  fn retain_for(&mut self, version: WireVersion) {
    match self {
      ClusterMessage::LoadModel(input) => input.task.retain_for(version),
      ClusterMessage::Forward(input) => input.retain_for(version),
      ClusterMessage::UnloadModel(_) | ClusterMessage::Execute(_) | ClusterMessage::SyncUp(_) => {}
    }
  }

  fn tenant_id(&self) -> Option<String> {
    match self {
      ClusterMessage::LoadModel(input) => input.task.tenant_id.clone(),
      ClusterMessage::Forward(input) => Versioned::tenant_id(input),
      _ => None,
    }
  }
}

impl Versioned for ClusterReply {
  fn retain_for(&mut self, _version: WireVersion) {}
}

impl Versioned for ModelNodeStatus {
  fn retain_for(&mut self, _version: WireVersion) {}
}

impl<R: Versioned> Versioned for NodesResponse<R> {
  fn retain_for(&mut self, version: WireVersion) {
    for success in self.successes.iter_mut() {
      success.value.retain_for(version);
    }
  }
}
