//! Out-of-band worker -> coordinator reports.

use std::sync::Arc;

use tokio_retry::RetryIf;

use crate::config::SettingsHandle;
use crate::coordinator::Coordinator;
use crate::error::{NodeError, ProtocolError, TaskError};
use crate::messaging::backoff;
use crate::model_index::RegisterModel;
use crate::models::NodeId;
use crate::protocol::{
  ClusterMessage, ClusterReply, FORWARD_IGNORED, FORWARD_OK, ForwardInput, ForwardRequestType, ForwardResponse,
  STATUS_LOADED,
};
use crate::task_registry::Recorded;
use crate::transport::Transport;

/// Worker side. Retries only failures that may be transient.
#[derive(Clone)]
pub struct ForwardSender {
  transport: Arc<dyn Transport>,
  settings: SettingsHandle,
}

impl ForwardSender {
  pub fn new(transport: Arc<dyn Transport>, settings: SettingsHandle) -> Self {
    Self { transport, settings }
  }

  pub async fn send(&self, coordinator: &NodeId, input: ForwardInput) -> Result<ForwardResponse, NodeError> {
    let settings = self.settings.snapshot();
    let timeout = settings.node_timeout();
    let strategy = backoff(settings.forward_retry_delay_ms, settings.forward_retries);
    let task_id = input.task_id.clone();

    let result = RetryIf::spawn(
      strategy,
      || {
        let message = ClusterMessage::Forward(input.clone());
        async move {
          match tokio::time::timeout(timeout, self.transport.send(coordinator, message)).await {
            Err(_) => Err(NodeError::Timeout { node_id: coordinator.clone(), after_ms: timeout.as_millis() as u64 }),
            Ok(Err(cause)) => Err(cause),
            Ok(Ok(ClusterReply::Forwarded(response))) => Ok(response),
            Ok(Ok(ClusterReply::Error(cause))) => Err(cause),
            Ok(Ok(other)) => Err(NodeError::protocol(format!("unexpected reply to forward: {:?}", other))),
          }
        }
      },
      |cause: &NodeError| {
        let retry = matches!(cause, NodeError::Transport { .. } | NodeError::Timeout { .. });
        if retry {
          tracing::warn!("Forward for task {} to {} failed, retrying: {}", task_id, coordinator, cause);
        }
        retry
      },
    )
    .await;

    if let Err(cause) = &result {
      tracing::error!("Giving up forwarding task {} to {}: {}", input.task_id, coordinator, cause);
    }
    result
  }
}

impl Coordinator {
  /// Coordinator side. Reports for unknown or finished tasks, or from nodes
  /// that were never asked, are logged and answered with `"ignored"`.
  pub async fn handle_forward(self: &Arc<Self>, input: ForwardInput) -> Result<ForwardResponse, ProtocolError> {
    input.validate()?;
    match input.request_kind {
      ForwardRequestType::UploadModel => {
        let Some(upload) = input.upload_input else {
          return Err(ProtocolError::InvalidForward("UPLOAD_MODEL without upload input".into()));
        };
        tracing::info!("Node {} uploaded model {}", input.worker_node_id, upload.model_id);
        self.register_model(RegisterModel::from_upload(upload, input.model_input)).await;
        Ok(ForwardResponse { status: FORWARD_OK.into() })
      }
      ForwardRequestType::LoadModelDone => self.record_load_done(input).await,
    }
  }

  async fn record_load_done(self: &Arc<Self>, input: ForwardInput) -> Result<ForwardResponse, ProtocolError> {
    let task_id = input.task_id.clone();
    let node = input.worker_node_id.clone();
    let outcome = input.outcome().map(|_| STATUS_LOADED.to_string());
    let mismatch = matches!(&outcome, Err(cause) if cause.is_hash_mismatch());

    let ignored = || ForwardResponse { status: FORWARD_IGNORED.into() };
    match self.registry.record_outcome(&task_id, &node, outcome) {
      Err(TaskError::UnknownTask(_)) => {
        tracing::info!("Forward from {} for unknown task {} ignored", node, task_id);
        return Ok(ignored());
      }
      Err(e) => {
        tracing::warn!("Forward from {} for task {} ignored: {}", node, task_id, e);
        return Ok(ignored());
      }
      Ok(Recorded::Ignored(reason)) => {
        tracing::info!("Forward from {} for task {} ignored: {:?}", node, task_id, reason);
        return Ok(ignored());
      }
      Ok(Recorded::Accepted { reported, expected, .. }) => {
        tracing::debug!("Task {}: {}/{} workers reported", task_id, reported, expected);
      }
    }

    if let Some(extra) = input.notify_nodes.filter(|nodes| !nodes.is_empty()) {
      self.notify_nodes.entry(task_id.clone()).or_default().extend(extra);
    }
    if mismatch {
      tracing::warn!("Node {} failed hash verification for task {}, aborting", node, task_id);
      self.close_unreported(&task_id, |_| NodeError::Aborted {
        message: format!("load aborted after hash mismatch on {}", node),
      });
    }
    self.maybe_finalize(&task_id).await;
    Ok(ForwardResponse { status: FORWARD_OK.into() })
  }
}
