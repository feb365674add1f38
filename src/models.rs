use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for NodeId {
  fn from(id: &str) -> Self {
    NodeId(id.to_string())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
  pub fn new() -> Self {
    Self(Uuid::new_v4().to_string())
  }
}

impl Default for TaskId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for TaskId {
  fn from(id: &str) -> Self {
    TaskId(id.to_string())
  }
}

pub type ModelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
  Created,
  Running,
  Completed,
  Failed,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed)
  }

  /// CREATED -> RUNNING -> {COMPLETED, FAILED}, plus CREATED -> FAILED.
  pub fn can_transition_to(self, target: TaskState) -> bool {
    matches!(
      (self, target),
      (TaskState::Created, TaskState::Running)
        | (TaskState::Created, TaskState::Failed)
        | (TaskState::Running, TaskState::Completed)
        | (TaskState::Running, TaskState::Failed)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskState::Created => "CREATED",
      TaskState::Running => "RUNNING",
      TaskState::Completed => "COMPLETED",
      TaskState::Failed => "FAILED",
    }
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
  LoadModel,
  UnloadModel,
  UploadModel,
  Training,
  Prediction,
  TrainingAndPrediction,
  Execution,
}

impl fmt::Display for TaskType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskType::LoadModel => "LOAD_MODEL",
      TaskType::UnloadModel => "UNLOAD_MODEL",
      TaskType::UploadModel => "UPLOAD_MODEL",
      TaskType::Training => "TRAINING",
      TaskType::Prediction => "PREDICTION",
      TaskType::TrainingAndPrediction => "TRAINING_AND_PREDICTION",
      TaskType::Execution => "EXECUTION",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionName {
  Kmeans,
  LinearRegression,
  TextEmbedding,
  Remote,
  Custom,
}

impl fmt::Display for FunctionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FunctionName::Kmeans => "KMEANS",
      FunctionName::LinearRegression => "LINEAR_REGRESSION",
      FunctionName::TextEmbedding => "TEXT_EMBEDDING",
      FunctionName::Remote => "REMOTE",
      FunctionName::Custom => "CUSTOM",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub task_id: TaskId,
  pub request_id: String,
  pub function_name: FunctionName,
  pub task_type: TaskType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model_id: Option<ModelId>,
  pub state: TaskState,
  pub dispatched: bool,
  pub is_async: bool,
  #[serde(default)]
  pub worker_node_ids: Vec<NodeId>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub create_time: DateTime<Utc>,
  pub last_update_time: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tenant_id: Option<String>,
}

/// What the caller knows when a task is created; the registry fills in the rest.
#[derive(Debug, Clone)]
pub struct TaskSpec {
  pub function_name: FunctionName,
  pub task_type: TaskType,
  pub model_id: Option<ModelId>,
  pub dispatched: bool,
  pub is_async: bool,
  pub tenant_id: Option<String>,
}

impl TaskSpec {
  pub fn new(function_name: FunctionName, task_type: TaskType) -> Self {
    Self {
      function_name,
      task_type,
      model_id: None,
      dispatched: false,
      is_async: false,
      tenant_id: None,
    }
  }

  pub fn model(mut self, model_id: impl Into<ModelId>) -> Self {
    self.model_id = Some(model_id.into());
    self
  }

  pub fn dispatched(mut self, dispatched: bool) -> Self {
    self.dispatched = dispatched;
    self
  }

  pub fn asynchronous(mut self, is_async: bool) -> Self {
    self.is_async = is_async;
    self
  }

  pub fn tenant(mut self, tenant_id: Option<String>) -> Self {
    self.tenant_id = tenant_id;
    self
  }
}

/// Lifecycle of one model on one worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
  NotLoaded,
  Loading,
  Loaded,
  LoadFailed,
}

impl ModelState {
  pub fn can_transition_to(self, target: ModelState) -> bool {
    matches!(
      (self, target),
      (ModelState::NotLoaded, ModelState::Loading)
        | (ModelState::Loading, ModelState::Loaded)
        | (ModelState::Loading, ModelState::LoadFailed)
        | (ModelState::Loaded, ModelState::NotLoaded)
        | (ModelState::LoadFailed, ModelState::Loading)
        | (ModelState::LoadFailed, ModelState::NotLoaded)
    )
  }
}

/// Cluster-wide view of a model kept by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelClusterState {
  Registered,
  Loading,
  Loaded,
  PartiallyLoaded,
  LoadFailed,
  Unloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
  pub model_id: ModelId,
  pub name: String,
  pub version: String,
  pub function_name: FunctionName,
  pub content_hash: String,
  pub size_bytes: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub config: Option<serde_json::Value>,
  pub state: ModelClusterState,
  #[serde(default)]
  pub deployed_nodes: Vec<NodeId>,
  #[serde(default)]
  pub planning_worker_node_count: usize,
  /// Nodes the last load was planned for.
  #[serde(default)]
  pub planning_worker_nodes: Vec<NodeId>,
  /// The last load asked for every live node rather than a custom plan.
  #[serde(default)]
  pub deploy_to_all_nodes: bool,
  #[serde(default)]
  pub auto_redeploy_retries: u32,
  pub last_update_time: DateTime<Utc>,
}
