//! Worker side of model deployment: the per-model state machine on this node
//! and the handlers for load, unload, execute and sync-up requests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::engine::{ModelEngine, ModelSource, content_hash};
use crate::error::NodeError;
use crate::forward::ForwardSender;
use crate::functions::{FunctionCall, FunctionTable};
use crate::models::{FunctionName, ModelId, ModelState, NodeId, TaskId};
use crate::protocol::{
  ClusterReply, ExecuteInput, ExecuteOutput, ForwardInput, LoadModelInput, LoadSuccess, ModelNodeStatus,
  STATUS_NOT_FOUND, STATUS_RECEIVED, SyncUpInput, UnloadModelInput, UploadModelInput, error_status,
};
use crate::worker_pool::WorkerPool;

/// What a load request found when it tried to claim the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadClaim {
  Claimed { previous: ModelState },
  AlreadyLoaded,
  InProgress,
}

#[derive(Debug, Default)]
pub struct ModelStateTable {
  states: DashMap<ModelId, ModelState>,
}

impl ModelStateTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self, model_id: &str) -> ModelState {
    self.states.get(model_id).map(|s| *s).unwrap_or(ModelState::NotLoaded)
  }

  /// Moves the model to LOADING unless it is loaded or loading already.
  pub fn claim_load(&self, model_id: &str) -> LoadClaim {
    match self.states.entry(model_id.to_string()) {
      Entry::Vacant(entry) => {
        entry.insert(ModelState::Loading);
        LoadClaim::Claimed { previous: ModelState::NotLoaded }
      }
      Entry::Occupied(mut entry) => {
        let current = *entry.get();
        match current {
          ModelState::Loaded => LoadClaim::AlreadyLoaded,
          ModelState::Loading => LoadClaim::InProgress,
          previous => {
            entry.insert(ModelState::Loading);
            LoadClaim::Claimed { previous }
          }
        }
      }
    }
  }

  pub fn transition(&self, model_id: &str, target: ModelState) -> Result<ModelState, ModelState> {
    let mut state = self.states.entry(model_id.to_string()).or_insert(ModelState::NotLoaded);
    let from = *state;
    if !from.can_transition_to(target) {
      return Err(from);
    }
    *state = target;
    Ok(from)
  }

  /// Puts back the state a claim replaced, when the load never started.
  fn release(&self, model_id: &str, previous: ModelState) {
    self.states.insert(model_id.to_string(), previous);
  }
}

#[derive(Debug, Clone)]
pub struct UploadModel {
  pub name: String,
  pub version: String,
  pub function_name: FunctionName,
  pub config: Option<Value>,
}

pub struct WorkerService {
  node_id: NodeId,
  coordinator_id: NodeId,
  engine: Arc<dyn ModelEngine>,
  source: Arc<dyn ModelSource>,
  functions: Arc<FunctionTable>,
  pool: WorkerPool,
  forwarder: ForwardSender,
  states: ModelStateTable,
  hashes: DashMap<ModelId, String>,
  routing: DashMap<ModelId, BTreeSet<NodeId>>,
}

impl WorkerService {
  pub fn new(
    node_id: NodeId,
    coordinator_id: NodeId,
    engine: Arc<dyn ModelEngine>,
    source: Arc<dyn ModelSource>,
    functions: FunctionTable,
    pool: WorkerPool,
    forwarder: ForwardSender,
  ) -> Arc<Self> {
    Arc::new(Self {
      node_id,
      coordinator_id,
      engine,
      source,
      functions: Arc::new(functions),
      pool,
      forwarder,
      states: ModelStateTable::new(),
      hashes: DashMap::new(),
      routing: DashMap::new(),
    })
  }

  pub fn node_id(&self) -> &NodeId {
    &self.node_id
  }

  pub fn model_state(&self, model_id: &str) -> ModelState {
    self.states.state(model_id)
  }

  /// Nodes the last sync-up said are serving `model_id`.
  pub fn routing(&self, model_id: &str) -> Vec<NodeId> {
    self
      .routing
      .get(model_id)
      .map(|nodes| nodes.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Acknowledges with `"received"` right away; the load itself runs on the
  /// pool and reports back through a forward.
  pub fn on_load(self: &Arc<Self>, input: LoadModelInput) -> ClusterReply {
    let model_id = input.model_id.clone();
    match self.states.claim_load(&model_id) {
      LoadClaim::AlreadyLoaded => {
        tracing::info!("Model {} already loaded on {}", model_id, self.node_id);
        let hash = self.hashes.get(&model_id).map(|h| h.clone()).unwrap_or_default();
        let outcome = if hash == input.model_content_hash {
          Ok(LoadSuccess { content_hash: hash })
        } else {
          Err(NodeError::HashMismatch { expected: input.model_content_hash.clone(), actual: hash })
        };
        self.spawn_forward(&input, outcome);
      }
      LoadClaim::InProgress => {
        return ClusterReply::Error(NodeError::Rejected {
          message: format!("model {} is already loading on {}", model_id, self.node_id),
        });
      }
      LoadClaim::Claimed { previous } => {
        let worker = self.clone();
        let job_input = input.clone();
        if let Err(cause) = self.pool.submit(async move { worker.load(job_input).await }) {
          self.states.release(&model_id, previous);
          tracing::warn!("Node {} turned away load of {}: {}", self.node_id, model_id, cause);
          return ClusterReply::Error(cause);
        }
      }
    }
    ClusterReply::ModelStatus(self.status_of(&model_id, STATUS_RECEIVED))
  }

  async fn load(self: Arc<Self>, input: LoadModelInput) {
    let model_id = input.model_id.clone();
    let outcome = self.fetch_and_verify(&input).await;
    let target = if outcome.is_ok() { ModelState::Loaded } else { ModelState::LoadFailed };
    if let Err(from) = self.states.transition(&model_id, target) {
      tracing::error!("Model {} on {} could not move {:?} -> {:?}", model_id, self.node_id, from, target);
    }
    match &outcome {
      Ok(success) => {
        self.hashes.insert(model_id.clone(), success.content_hash.clone());
        tracing::info!("Model {} loaded on {}", model_id, self.node_id);
      }
      Err(cause) => tracing::warn!("Model {} failed to load on {}: {}", model_id, self.node_id, cause),
    }
    self.forward(&input, outcome).await;
  }

  async fn fetch_and_verify(&self, input: &LoadModelInput) -> Result<LoadSuccess, NodeError> {
    let bytes = self.source.fetch(&input.model_id).await?;
    let actual = self.engine.load(&input.model_id, bytes).await?;
    if actual != input.model_content_hash {
      if let Err(e) = self.engine.unload(&input.model_id).await {
        tracing::warn!("Unloading corrupt model {} failed: {}", input.model_id, e);
      }
      return Err(NodeError::HashMismatch { expected: input.model_content_hash.clone(), actual });
    }
    Ok(LoadSuccess { content_hash: actual })
  }

  fn spawn_forward(self: &Arc<Self>, input: &LoadModelInput, outcome: Result<LoadSuccess, NodeError>) {
    let worker = self.clone();
    let input = input.clone();
    tokio::spawn(async move { worker.forward(&input, outcome).await });
  }

  async fn forward(&self, input: &LoadModelInput, outcome: Result<LoadSuccess, NodeError>) {
    let mut forward = ForwardInput::load_done(input.task_id.clone(), input.model_id.clone(), self.node_id.clone(), outcome);
    forward.task = Some(input.task.clone());
    match self.forwarder.send(&input.coordinating_node_id, forward).await {
      Ok(response) => tracing::debug!("Load report for task {} answered {}", input.task_id, response.status),
      Err(cause) => tracing::warn!("Load report for task {} from {} was lost: {}", input.task_id, self.node_id, cause),
    }
  }

  pub async fn on_unload(&self, input: UnloadModelInput) -> ClusterReply {
    let mut statuses = BTreeMap::new();
    for model_id in input.model_ids {
      let status = match self.states.state(&model_id) {
        ModelState::NotLoaded => STATUS_NOT_FOUND.to_string(),
        ModelState::Loading => error_status("load in progress"),
        ModelState::Loaded | ModelState::LoadFailed => match self.engine.unload(&model_id).await {
          Ok(status) => {
            if let Err(from) = self.states.transition(&model_id, ModelState::NotLoaded) {
              tracing::warn!("Model {} on {} unloaded from unexpected state {:?}", model_id, self.node_id, from);
            }
            self.hashes.remove(&model_id);
            status
          }
          Err(cause) => error_status(cause),
        },
      };
      tracing::info!("Unload of {} on {}: {}", model_id, self.node_id, status);
      statuses.insert(model_id, status);
    }
    ClusterReply::ModelStatus(ModelNodeStatus { node_id: self.node_id.clone(), statuses })
  }

  pub async fn on_execute(&self, input: ExecuteInput) -> ClusterReply {
    if let Some(model_id) = &input.model_id {
      if self.states.state(model_id) != ModelState::Loaded {
        return ClusterReply::Error(NodeError::Rejected {
          message: format!("model {} is not loaded on {}", model_id, self.node_id),
        });
      }
    }
    let functions = self.functions.clone();
    let call = FunctionCall {
      task_type: input.task_type,
      model_id: input.model_id,
      input: input.input,
      engine: self.engine.clone(),
    };
    let name = input.function_name;
    tracing::debug!("Executing {} for task {} on {}", name, input.task_id, self.node_id);
    match self.pool.run(async move { functions.call(name, call).await }).await {
      Ok(output) => ClusterReply::Output(ExecuteOutput { node_id: self.node_id.clone(), output }),
      Err(cause) => ClusterReply::Error(cause),
    }
  }

  pub fn on_sync_up(&self, input: SyncUpInput) -> ClusterReply {
    for (model_id, nodes) in input.added_worker_nodes {
      self.routing.entry(model_id).or_default().extend(nodes);
    }
    for (model_id, nodes) in input.removed_worker_nodes {
      if let Some(mut serving) = self.routing.get_mut(&model_id) {
        for node in &nodes {
          serving.remove(node);
        }
      }
      self.routing.remove_if(&model_id, |_, serving| serving.is_empty());
    }
    ClusterReply::Ack
  }

  /// Stores an uploaded model locally and tells the coordinator about it.
  pub async fn upload_model(&self, request: UploadModel, bytes: Vec<u8>) -> Result<UploadModelInput, NodeError> {
    let upload = UploadModelInput {
      model_id: uuid::Uuid::new_v4().to_string(),
      name: request.name,
      version: request.version,
      function_name: request.function_name,
      content_hash: content_hash(&bytes),
      size_bytes: bytes.len() as u64,
    };
    self.source.store(&upload.model_id, bytes).await?;
    let forward = ForwardInput::upload(TaskId::new(), self.node_id.clone(), upload.clone(), request.config);
    self.forwarder.send(&self.coordinator_id, forward).await?;
    tracing::info!("Uploaded model {} from {}", upload.model_id, self.node_id);
    Ok(upload)
  }

  fn status_of(&self, model_id: &str, status: &str) -> ModelNodeStatus {
    ModelNodeStatus {
      node_id: self.node_id.clone(),
      statuses: BTreeMap::from([(model_id.to_string(), status.to_string())]),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn claim_load_walks_the_model_states() {
    let table = ModelStateTable::new();
    assert_eq!(table.claim_load("m1"), LoadClaim::Claimed { previous: ModelState::NotLoaded });
    assert_eq!(table.claim_load("m1"), LoadClaim::InProgress);

    assert_eq!(table.transition("m1", ModelState::LoadFailed), Ok(ModelState::Loading));
    assert_eq!(table.claim_load("m1"), LoadClaim::Claimed { previous: ModelState::LoadFailed });

    table.transition("m1", ModelState::Loaded).unwrap();
    assert_eq!(table.claim_load("m1"), LoadClaim::AlreadyLoaded);
  }

  #[test]
  fn illegal_model_transition_reports_current_state() {
    let table = ModelStateTable::new();
    assert_eq!(table.transition("m1", ModelState::Loaded), Err(ModelState::NotLoaded));
    assert_eq!(table.state("m1"), ModelState::NotLoaded);
  }

  #[test]
  fn release_restores_previous_state() {
    let table = ModelStateTable::new();
    table.claim_load("m1");
    table.release("m1", ModelState::NotLoaded);
    assert_eq!(table.state("m1"), ModelState::NotLoaded);
  }
}
