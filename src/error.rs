use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{NodeId, TaskId, TaskState};

/// Registry-level failures. These are coordinator-side and never cross the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  #[error("unknown task: {0}")]
  UnknownTask(TaskId),

  #[error("invalid transition for task {task_id}: {from} -> {to}")]
  InvalidTransition { task_id: TaskId, from: TaskState, to: TaskState },

  #[error("task {task_id} is not terminal (state {state})")]
  NotTerminal { task_id: TaskId, state: TaskState },
}

/// Per-node failure causes. Carried as data inside node responses and
/// forward notifications, so it must stay serializable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
  #[error("node {node_id} did not respond within {after_ms}ms")]
  Timeout { node_id: NodeId, after_ms: u64 },

  #[error("transport failure: {message}")]
  Transport { message: String },

  #[error("model content hash mismatch: expected {expected}, got {actual}")]
  HashMismatch { expected: String, actual: String },

  #[error("model engine error: {message}")]
  Engine { message: String },

  #[error("rejected: {message}")]
  Rejected { message: String },

  #[error("handler error: {message}")]
  Handler { message: String },

  #[error("aborted: {message}")]
  Aborted { message: String },

  #[error("protocol error: {message}")]
  Protocol { message: String },
}

impl NodeError {
  pub fn transport(message: impl Into<String>) -> Self {
    NodeError::Transport { message: message.into() }
  }

  pub fn engine(message: impl Into<String>) -> Self {
    NodeError::Engine { message: message.into() }
  }

  pub fn handler(message: impl Into<String>) -> Self {
    NodeError::Handler { message: message.into() }
  }

  pub fn protocol(message: impl Into<String>) -> Self {
    NodeError::Protocol { message: message.into() }
  }

  pub fn is_hash_mismatch(&self) -> bool {
    matches!(self, NodeError::HashMismatch { .. })
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
  #[error("invalid forward input: {0}")]
  InvalidForward(String),

  #[error("node {node_id} cannot handle {message}: {reason}")]
  WrongRole { node_id: NodeId, message: &'static str, reason: &'static str },
}

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("malformed envelope: {0}")]
  Malformed(#[from] serde_json::Error),

  #[error("unsupported wire version {0}")]
  UnsupportedVersion(u32),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
  #[error("model not found: {0}")]
  ModelNotFound(String),

  #[error("no eligible node found")]
  NoEligibleNodes,

  #[error("exceed max running task limit ({limit}) for {task_type}")]
  LimitExceeded { task_type: String, limit: usize },

  #[error("invalid deployment plan: {0}")]
  InvalidPlan(String),

  #[error(transparent)]
  Task(#[from] TaskError),

  #[error(transparent)]
  Protocol(#[from] ProtocolError),
}
