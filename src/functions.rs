//! Static `FunctionName -> handler` table used by workers to run train,
//! predict and execute requests. Built once at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::engine::ModelEngine;
use crate::error::NodeError;
use crate::models::{FunctionName, ModelId, TaskType};

/// Everything a handler gets to see about one request.
#[derive(Clone)]
pub struct FunctionCall {
  pub task_type: TaskType,
  pub model_id: Option<ModelId>,
  pub input: Value,
  pub engine: Arc<dyn ModelEngine>,
}

pub type FunctionHandler = Arc<dyn Fn(FunctionCall) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct FunctionTable {
  handlers: HashMap<FunctionName, FunctionHandler>,
}

impl FunctionTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Model-backed functions answer predictions through the engine.
  pub fn with_model_functions() -> Self {
    let mut table = Self::new();
    for name in [FunctionName::TextEmbedding, FunctionName::Remote, FunctionName::Custom] {
      table.register(name, predict_with_engine);
    }
    table
  }

  pub fn register<F, Fut>(&mut self, name: FunctionName, handler: F)
  where
    F: Fn(FunctionCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
  {
    let handler: FunctionHandler = Arc::new(move |call| handler(call).boxed());
    self.handlers.insert(name, handler);
    tracing::info!("Registered function handler: {}", name);
  }

  pub fn contains(&self, name: FunctionName) -> bool {
    self.handlers.contains_key(&name)
  }

  pub async fn call(&self, name: FunctionName, call: FunctionCall) -> Result<Value, NodeError> {
    match self.handlers.get(&name) {
      Some(handler) => handler(call).await,
      None => {
        tracing::error!("No handler registered for function {}", name);
        Err(NodeError::Rejected { message: format!("unsupported function: {}", name) })
      }
    }
  }
}

async fn predict_with_engine(call: FunctionCall) -> Result<Value, NodeError> {
  if call.task_type != TaskType::Prediction {
    return Err(NodeError::Rejected { message: format!("{} is not supported for model functions", call.task_type) });
  }
  let model_id = call
    .model_id
    .ok_or_else(|| NodeError::Rejected { message: "prediction needs a model id".into() })?;
  call.engine.predict(&model_id, call.input).await
}
