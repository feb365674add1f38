//! Coordinator-side catalogue of registered models and where they run.

use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{FunctionName, ModelClusterState, ModelId, ModelMeta, NodeId};
use crate::protocol::UploadModelInput;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterModel {
  #[serde(default)]
  pub model_id: Option<ModelId>,
  pub name: String,
  pub version: String,
  pub function_name: FunctionName,
  pub content_hash: String,
  #[serde(default)]
  pub size_bytes: u64,
  #[serde(default)]
  pub config: Option<Value>,
}

impl RegisterModel {
  pub fn from_upload(upload: UploadModelInput, config: Option<Value>) -> Self {
    Self {
      model_id: Some(upload.model_id),
      name: upload.name,
      version: upload.version,
      function_name: upload.function_name,
      content_hash: upload.content_hash,
      size_bytes: upload.size_bytes,
      config,
    }
  }
}

#[derive(Debug, Default)]
pub struct ModelIndex {
  models: DashMap<ModelId, ModelMeta>,
}

impl ModelIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registering an id again replaces its metadata but keeps its deployment.
  pub fn register(&self, request: RegisterModel) -> ModelMeta {
    let model_id = request.model_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut entry = self.models.entry(model_id.clone()).or_insert_with(|| ModelMeta {
      model_id: model_id.clone(),
      name: String::new(),
      version: String::new(),
      function_name: request.function_name,
      content_hash: String::new(),
      size_bytes: 0,
      config: None,
      state: ModelClusterState::Registered,
      deployed_nodes: Vec::new(),
      planning_worker_node_count: 0,
      planning_worker_nodes: Vec::new(),
      deploy_to_all_nodes: false,
      auto_redeploy_retries: 0,
      last_update_time: Utc::now(),
    });
    entry.name = request.name;
    entry.version = request.version;
    entry.function_name = request.function_name;
    entry.content_hash = request.content_hash;
    entry.size_bytes = request.size_bytes;
    entry.config = request.config;
    entry.last_update_time = Utc::now();
    tracing::info!("Registered model {} ({} v{})", model_id, entry.name, entry.version);
    entry.clone()
  }

  pub fn get(&self, model_id: &str) -> Option<ModelMeta> {
    self.models.get(model_id).map(|m| m.clone())
  }

  pub fn list(&self) -> Vec<ModelMeta> {
    let mut models: Vec<ModelMeta> = self.models.iter().map(|m| m.clone()).collect();
    models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    models
  }

  pub fn restore(&self, models: Vec<ModelMeta>) -> usize {
    let mut restored = 0;
    for meta in models {
      if !self.models.contains_key(&meta.model_id) {
        self.models.insert(meta.model_id.clone(), meta);
        restored += 1;
      }
    }
    restored
  }

  pub fn mark_loading(&self, model_id: &str, planned: &[NodeId], deploy_to_all_nodes: bool) -> Option<ModelMeta> {
    let mut meta = self.models.get_mut(model_id)?;
    meta.state = ModelClusterState::Loading;
    meta.planning_worker_node_count = planned.len();
    meta.planning_worker_nodes = planned.to_vec();
    meta.deploy_to_all_nodes = deploy_to_all_nodes;
    meta.last_update_time = Utc::now();
    Some(meta.clone())
  }

  /// Counts one automatic redeploy attempt against the model.
  pub fn note_redeploy(&self, model_id: &str) -> Option<ModelMeta> {
    let mut meta = self.models.get_mut(model_id)?;
    meta.auto_redeploy_retries += 1;
    meta.last_update_time = Utc::now();
    Some(meta.clone())
  }

  /// Folds a finished load into the model's deployment.
  pub fn record_load(&self, model_id: &str, loaded: &[NodeId]) -> Option<ModelMeta> {
    let mut meta = self.models.get_mut(model_id)?;
    let mut deployed: BTreeSet<NodeId> = meta.deployed_nodes.iter().cloned().collect();
    deployed.extend(loaded.iter().cloned());
    meta.deployed_nodes = deployed.into_iter().collect();
    meta.state = if loaded.is_empty() && meta.deployed_nodes.is_empty() {
      ModelClusterState::LoadFailed
    } else if meta.deployed_nodes.len() >= meta.planning_worker_node_count {
      meta.auto_redeploy_retries = 0;
      ModelClusterState::Loaded
    } else {
      ModelClusterState::PartiallyLoaded
    };
    meta.last_update_time = Utc::now();
    Some(meta.clone())
  }

  pub fn record_unload(&self, model_id: &str, nodes: &[NodeId]) -> Option<ModelMeta> {
    let mut meta = self.models.get_mut(model_id)?;
    meta.deployed_nodes.retain(|n| !nodes.contains(n));
    // An explicit unload narrows the plan, so a rejoining node does not get
    // the model pushed back.
    meta.planning_worker_nodes.retain(|n| !nodes.contains(n));
    if !nodes.is_empty() {
      meta.deploy_to_all_nodes = false;
    }
    if meta.deployed_nodes.is_empty() {
      meta.state = ModelClusterState::Unloaded;
      meta.planning_worker_node_count = 0;
    } else {
      meta.state = ModelClusterState::PartiallyLoaded;
    }
    meta.last_update_time = Utc::now();
    Some(meta.clone())
  }

  pub fn serving_nodes(&self, model_id: &str) -> Vec<NodeId> {
    self.models.get(model_id).map(|m| m.deployed_nodes.clone()).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn register(index: &ModelIndex, id: &str) -> ModelMeta {
    index.register(RegisterModel {
      model_id: Some(id.into()),
      name: "embedder".into(),
      version: "1".into(),
      function_name: FunctionName::TextEmbedding,
      content_hash: "abc".into(),
      size_bytes: 3,
      config: None,
    })
  }

  fn nodes(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
  }

  #[test]
  fn register_generates_an_id_when_missing() {
    let index = ModelIndex::new();
    let meta = index.register(RegisterModel {
      model_id: None,
      name: "n".into(),
      version: "1".into(),
      function_name: FunctionName::Custom,
      content_hash: "h".into(),
      size_bytes: 0,
      config: None,
    });
    assert!(!meta.model_id.is_empty());
    assert_eq!(meta.state, ModelClusterState::Registered);
    assert_eq!(index.get(&meta.model_id), Some(meta));
  }

  #[test]
  fn partial_load_is_tracked() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a", "b", "c"]), true);

    let meta = index.record_load("m1", &nodes(&["a", "b"])).unwrap();
    assert_eq!(meta.state, ModelClusterState::PartiallyLoaded);
    assert_eq!(meta.deployed_nodes, nodes(&["a", "b"]));

    let failed = index.record_load("m1", &[]).unwrap();
    assert_eq!(failed.state, ModelClusterState::PartiallyLoaded);
  }

  #[test]
  fn failed_first_load_marks_model_failed() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a", "b"]), true);
    assert_eq!(index.record_load("m1", &[]).unwrap().state, ModelClusterState::LoadFailed);
  }

  #[test]
  fn unloading_every_node_marks_model_unloaded() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a", "b"]), true);
    index.record_load("m1", &nodes(&["a", "b"]));

    assert_eq!(index.record_unload("m1", &nodes(&["a"])).unwrap().state, ModelClusterState::PartiallyLoaded);
    assert_eq!(index.record_unload("m1", &nodes(&["b"])).unwrap().state, ModelClusterState::Unloaded);
    assert!(index.serving_nodes("m1").is_empty());
  }

  #[test]
  fn full_load_resets_redeploy_attempts() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a", "b"]), true);
    index.record_load("m1", &nodes(&["a"]));
    assert_eq!(index.note_redeploy("m1").unwrap().auto_redeploy_retries, 1);

    let meta = index.record_load("m1", &nodes(&["b"])).unwrap();
    assert_eq!(meta.state, ModelClusterState::Loaded);
    assert_eq!(meta.auto_redeploy_retries, 0);
  }

  #[test]
  fn unload_narrows_the_plan() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a", "b"]), true);
    index.record_load("m1", &nodes(&["a", "b"]));

    let meta = index.record_unload("m1", &nodes(&["b"])).unwrap();
    assert_eq!(meta.planning_worker_nodes, nodes(&["a"]));
    assert!(!meta.deploy_to_all_nodes);
  }

  #[test]
  fn reregistering_keeps_deployment() {
    let index = ModelIndex::new();
    register(&index, "m1");
    index.mark_loading("m1", &nodes(&["a"]), true);
    index.record_load("m1", &nodes(&["a"]));

    let again = register(&index, "m1");
    assert_eq!(again.deployed_nodes, nodes(&["a"]));
    assert_eq!(again.state, ModelClusterState::Loaded);
  }
}
