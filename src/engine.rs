//! Model engine and model source seams, with the in-memory and on-disk
//! implementations the binaries and tests run on.

use std::path::PathBuf;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::NodeError;
use crate::models::ModelId;
use crate::protocol::{STATUS_NOT_FOUND, STATUS_UNLOADED};

pub trait ModelEngine: Send + Sync {
  /// Loads the model and returns the content hash it computed.
  fn load(&self, model_id: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<String, NodeError>>;
  /// Returns `"unloaded"` or `"not_found"`.
  fn unload(&self, model_id: &str) -> BoxFuture<'_, Result<String, NodeError>>;
  fn predict(&self, model_id: &str, input: Value) -> BoxFuture<'_, Result<Value, NodeError>>;
}

pub trait ModelSource: Send + Sync {
  fn fetch(&self, model_id: &str) -> BoxFuture<'_, Result<Vec<u8>, NodeError>>;
  fn store(&self, model_id: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), NodeError>>;
}

pub fn content_hash(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
struct LoadedModel {
  content_hash: String,
  size_bytes: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryEngine {
  models: DashMap<ModelId, LoadedModel>,
}

impl InMemoryEngine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_loaded(&self, model_id: &str) -> bool {
    self.models.contains_key(model_id)
  }
}

impl ModelEngine for InMemoryEngine {
  fn load(&self, model_id: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<String, NodeError>> {
    let model_id = model_id.to_string();
    async move {
      if bytes.is_empty() {
        return Err(NodeError::engine(format!("model {} has no content", model_id)));
      }
      let hash = content_hash(&bytes);
      self
        .models
        .insert(model_id, LoadedModel { content_hash: hash.clone(), size_bytes: bytes.len() });
      Ok(hash)
    }
    .boxed()
  }

  fn unload(&self, model_id: &str) -> BoxFuture<'_, Result<String, NodeError>> {
    let removed = self.models.remove(model_id).is_some();
    let status = if removed { STATUS_UNLOADED } else { STATUS_NOT_FOUND };
    async move { Ok(status.to_string()) }.boxed()
  }

  fn predict(&self, model_id: &str, input: Value) -> BoxFuture<'_, Result<Value, NodeError>> {
    let loaded = self.models.get(model_id).map(|m| m.clone());
    let model_id = model_id.to_string();
    async move {
      let model = loaded.ok_or_else(|| NodeError::engine(format!("model {} is not loaded", model_id)))?;
      Ok(json!({
        "model_id": model_id,
        "content_hash": model.content_hash,
        "size_bytes": model.size_bytes,
        "input": input,
      }))
    }
    .boxed()
  }
}

#[derive(Debug, Default)]
pub struct MemoryModelSource {
  blobs: DashMap<ModelId, Vec<u8>>,
}

impl MemoryModelSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put(&self, model_id: impl Into<ModelId>, bytes: impl Into<Vec<u8>>) {
    self.blobs.insert(model_id.into(), bytes.into());
  }
}

impl ModelSource for MemoryModelSource {
  fn fetch(&self, model_id: &str) -> BoxFuture<'_, Result<Vec<u8>, NodeError>> {
    let found = self.blobs.get(model_id).map(|b| b.clone());
    let model_id = model_id.to_string();
    async move { found.ok_or_else(|| NodeError::engine(format!("no content for model {}", model_id))) }.boxed()
  }

  fn store(&self, model_id: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), NodeError>> {
    self.blobs.insert(model_id.to_string(), bytes);
    async { Ok(()) }.boxed()
  }
}

/// One file per model under a directory.
#[derive(Debug, Clone)]
pub struct FileModelSource {
  dir: PathBuf,
}

impl FileModelSource {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  fn path_for(&self, model_id: &str) -> Result<PathBuf, NodeError> {
    if model_id.is_empty() || model_id.starts_with('.') || model_id.contains(['/', '\\']) {
      return Err(NodeError::engine(format!("invalid model id {:?}", model_id)));
    }
    Ok(self.dir.join(model_id))
  }
}

impl ModelSource for FileModelSource {
  fn fetch(&self, model_id: &str) -> BoxFuture<'_, Result<Vec<u8>, NodeError>> {
    let path = self.path_for(model_id);
    async move {
      let path = path?;
      tokio::task::spawn_blocking(move || std::fs::read(&path).map_err(|e| (path, e)))
        .await
        .map_err(|e| NodeError::handler(e.to_string()))?
        .map_err(|(path, e)| NodeError::engine(format!("reading {}: {}", path.display(), e)))
    }
    .boxed()
  }

  fn store(&self, model_id: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), NodeError>> {
    let path = self.path_for(model_id);
    let dir = self.dir.clone();
    async move {
      let path = path?;
      tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, bytes)
      })
      .await
      .map_err(|e| NodeError::handler(e.to_string()))?
      .map_err(|e| NodeError::engine(format!("storing model: {}", e)))
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn load_reports_sha256_of_content() {
    let engine = InMemoryEngine::new();
    let hash = engine.load("m1", b"weights".to_vec()).await.unwrap();

    assert_eq!(hash, content_hash(b"weights"));
    assert_eq!(hash.len(), 64);
    assert!(engine.is_loaded("m1"));
  }

  #[tokio::test]
  async fn unload_distinguishes_missing_models() {
    let engine = InMemoryEngine::new();
    engine.load("m1", b"w".to_vec()).await.unwrap();

    assert_eq!(engine.unload("m1").await.unwrap(), "unloaded");
    assert_eq!(engine.unload("m1").await.unwrap(), "not_found");
  }

  #[tokio::test]
  async fn predict_needs_a_loaded_model() {
    let engine = InMemoryEngine::new();
    let err = engine.predict("m1", json!([1, 2])).await.unwrap_err();
    assert!(matches!(err, NodeError::Engine { .. }));

    engine.load("m1", b"w".to_vec()).await.unwrap();
    let out = engine.predict("m1", json!([1, 2])).await.unwrap();
    assert_eq!(out["input"], json!([1, 2]));
  }

  #[tokio::test]
  async fn file_source_refuses_path_escapes() {
    let source = FileModelSource::new(std::env::temp_dir());
    assert!(source.fetch("../etc/passwd").await.is_err());
    assert!(source.fetch(".hidden").await.is_err());
  }

  #[tokio::test]
  async fn file_source_stores_and_fetches() {
    let dir = std::env::temp_dir().join(format!("mlcoord-models-{}", uuid::Uuid::new_v4()));
    let source = FileModelSource::new(&dir);
    source.store("m1", b"weights".to_vec()).await.unwrap();

    assert_eq!(source.fetch("m1").await.unwrap(), b"weights".to_vec());
    let _ = std::fs::remove_dir_all(dir);
  }
}
