use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use lapin::Channel;
use tracing::{info, warn};

use crate::config::{Config, Settings, SettingsHandle};
use crate::coordinator::Coordinator;
use crate::database::{MemoryTaskStore, PgTaskStore, TaskStore, setup_database};
use crate::deployment::WorkerService;
use crate::engine::{FileModelSource, InMemoryEngine, MemoryModelSource, ModelEngine, ModelSource};
use crate::error::{NodeError, ProtocolError};
use crate::forward::ForwardSender;
use crate::functions::FunctionTable;
use crate::models::NodeId;
use crate::messaging::{AmqpTransport, create_rabbit_channel};
use crate::protocol::{ClusterMessage, ClusterReply};
use crate::transport::{MessageHandler, Membership, StaticMembership, Transport};
use crate::worker_pool::WorkerPool;

/// Wires one node's services together.
pub struct NodeBuilder {
  node_id: NodeId,
  coordinator_id: NodeId,
  settings: SettingsHandle,
  engine: Arc<dyn ModelEngine>,
  source: Arc<dyn ModelSource>,
  functions: FunctionTable,
  store: Arc<dyn TaskStore>,
}

impl NodeBuilder {
  pub fn new(node_id: NodeId, coordinator_id: NodeId) -> Self {
    Self {
      node_id,
      coordinator_id,
      settings: SettingsHandle::default(),
      engine: Arc::new(InMemoryEngine::new()),
      source: Arc::new(MemoryModelSource::new()),
      functions: FunctionTable::with_model_functions(),
      store: Arc::new(MemoryTaskStore::new()),
    }
  }

  pub fn settings(mut self, settings: SettingsHandle) -> Self {
    self.settings = settings;
    self
  }

  pub fn engine(mut self, engine: Arc<dyn ModelEngine>) -> Self {
    self.engine = engine;
    self
  }

  pub fn source(mut self, source: Arc<dyn ModelSource>) -> Self {
    self.source = source;
    self
  }

  pub fn functions(mut self, functions: FunctionTable) -> Self {
    self.functions = functions;
    self
  }

  pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
    self.store = store;
    self
  }

  /// Must run inside a tokio runtime; the worker pool starts here.
  pub fn build(self, transport: Arc<dyn Transport>, membership: Arc<dyn Membership>) -> NodeService {
    let settings = self.settings.snapshot();
    let pool = WorkerPool::new(settings.worker_pool_size, settings.worker_queue_capacity);
    let forwarder = ForwardSender::new(transport.clone(), self.settings.clone());
    let worker = WorkerService::new(
      self.node_id.clone(),
      self.coordinator_id.clone(),
      self.engine,
      self.source,
      self.functions,
      pool,
      forwarder,
    );
    if self.node_id == self.coordinator_id {
      let coordinator = Coordinator::new(transport, membership, self.settings, self.store);
      NodeService::coordinating(worker, coordinator)
    } else {
      NodeService::worker(worker)
    }
  }
}

/// Builds a node from process configuration: settings file, optional
/// Postgres store, RabbitMQ transport and on-disk model files. The returned
/// channel is the one `messaging::serve` should consume from.
pub async fn connect(config: &Config) -> Result<(NodeService, Channel)> {
  let settings = match &config.settings_path {
    Some(path) => Settings::from_file(path)?,
    None => Settings::default(),
  };
  let store: Arc<dyn TaskStore> = match &config.database_url {
    Some(url) => Arc::new(PgTaskStore::new(setup_database(url).await?)),
    None => {
      warn!("DATABASE_URL not set, task state will not survive a restart");
      Arc::new(MemoryTaskStore::new())
    }
  };

  let channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  let transport = AmqpTransport::connect(channel.clone(), config.peer_wire_version).await?;
  let membership = StaticMembership::new(
    config.node_id.clone(),
    config.cluster_nodes.clone(),
    config.cluster_name.clone(),
  );
  info!(
    "Node {} joining {} (coordinator {})",
    config.node_id, config.cluster_name, config.coordinator_node_id
  );

  let node = NodeBuilder::new(config.node_id.clone(), config.coordinator_node_id.clone())
    .settings(SettingsHandle::new(settings))
    .source(Arc::new(FileModelSource::new(config.model_dir.clone())))
    .store(store)
    .build(transport, Arc::new(membership));
  Ok((node, channel))
}

/// Routes inbound cluster messages to the roles this node plays. Every node
/// is a worker; one of them is also the coordinator.
#[derive(Clone)]
pub struct NodeService {
  worker: Arc<WorkerService>,
  coordinator: Option<Arc<Coordinator>>,
}

impl NodeService {
  pub fn worker(worker: Arc<WorkerService>) -> Self {
    Self { worker, coordinator: None }
  }

  pub fn coordinating(worker: Arc<WorkerService>, coordinator: Arc<Coordinator>) -> Self {
    Self { worker, coordinator: Some(coordinator) }
  }

  pub fn worker_service(&self) -> &Arc<WorkerService> {
    &self.worker
  }

  pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
    self.coordinator.as_ref()
  }
}

impl MessageHandler for NodeService {
  fn on_message(&self, message: ClusterMessage) -> BoxFuture<'_, ClusterReply> {
    async move {
      tracing::debug!("Node {} received {}", self.worker.node_id(), message.name());
      match message {
        ClusterMessage::LoadModel(input) => self.worker.on_load(input),
        ClusterMessage::UnloadModel(input) => self.worker.on_unload(input).await,
        ClusterMessage::Execute(input) => self.worker.on_execute(input).await,
        ClusterMessage::SyncUp(input) => self.worker.on_sync_up(input),
        ClusterMessage::Forward(input) => {
          let Some(coordinator) = &self.coordinator else {
            let err = ProtocolError::WrongRole {
              node_id: self.worker.node_id().clone(),
              message: "forward",
              reason: "not the coordinating node",
            };
            tracing::warn!("{}", err);
            return ClusterReply::Error(NodeError::protocol(err.to_string()));
          };
          match coordinator.handle_forward(input).await {
            Ok(response) => ClusterReply::Forwarded(response),
            Err(e) => {
              tracing::warn!("Rejected forward: {}", e);
              ClusterReply::Error(NodeError::protocol(e.to_string()))
            }
          }
        }
      }
    }
    .boxed()
  }
}
