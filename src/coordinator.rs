//! The coordinating node: owns the task registry and the model index, fans
//! cluster operations out to workers and folds their answers back in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregator::{CompletionPolicy, aggregate};
use crate::config::{Settings, SettingsHandle};
use crate::database::TaskStore;
use crate::dispatch::{NodeRequest, NodesRequest, NodesResponse, dispatch};
use crate::error::{CoordinatorError, NodeError, TaskError};
use crate::model_index::{ModelIndex, RegisterModel};
use crate::models::{
  FunctionName, ModelClusterState, ModelId, ModelMeta, NodeId, Task, TaskId, TaskSpec, TaskState, TaskType,
};
use crate::protocol::{
  ClusterMessage, ClusterModelStatus, ClusterReply, ExecuteInput, ExecuteOutput, LoadModelInput, ModelNodeStatus,
  STATUS_NOT_FOUND, STATUS_UNLOADED, SyncUpInput, UnloadModelInput, merge_statuses,
};
use crate::task_registry::{Recorded, TaskRegistry};
use crate::transport::{Membership, Transport};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadModelRequest {
  #[serde(default)]
  pub node_ids: Option<Vec<NodeId>>,
  #[serde(default)]
  pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelResponse {
  pub task_id: TaskId,
  pub status: TaskState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnloadModelRequest {
  pub model_ids: Vec<ModelId>,
  #[serde(default)]
  pub node_ids: Option<Vec<NodeId>>,
  #[serde(default)]
  pub policy: Option<CompletionPolicy>,
  #[serde(default)]
  pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnloadModelResponse {
  pub task_id: TaskId,
  pub state: TaskState,
  pub nodes: ClusterModelStatus,
  pub report: NodesResponse<ModelNodeStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
  pub function_name: FunctionName,
  pub task_type: TaskType,
  #[serde(default)]
  pub model_id: Option<ModelId>,
  #[serde(default)]
  pub node_id: Option<NodeId>,
  #[serde(default)]
  pub input: Value,
  #[serde(default)]
  pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
  pub task_id: TaskId,
  pub state: TaskState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  pub report: NodesResponse<ExecuteOutput>,
}

pub struct Coordinator {
  pub(crate) node_id: NodeId,
  pub(crate) registry: TaskRegistry,
  pub(crate) models: ModelIndex,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) membership: Arc<dyn Membership>,
  pub(crate) settings: SettingsHandle,
  pub(crate) store: Arc<dyn TaskStore>,
  /// Extra nodes named by workers' forwards, told about the result too.
  pub(crate) notify_nodes: DashMap<TaskId, BTreeSet<NodeId>>,
  next_target: AtomicUsize,
}

impl Coordinator {
  pub fn new(
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    settings: SettingsHandle,
    store: Arc<dyn TaskStore>,
  ) -> Arc<Self> {
    Arc::new(Self {
      node_id: membership.local_node(),
      registry: TaskRegistry::new(),
      models: ModelIndex::new(),
      transport,
      membership,
      settings,
      store,
      notify_nodes: DashMap::new(),
      next_target: AtomicUsize::new(0),
    })
  }

  pub fn node_id(&self) -> &NodeId {
    &self.node_id
  }

  pub fn settings(&self) -> &SettingsHandle {
    &self.settings
  }

  pub fn cluster_name(&self) -> String {
    self.membership.cluster_name()
  }

  pub fn get_task(&self, task_id: &TaskId) -> Result<Task, TaskError> {
    self.registry.get(task_id)
  }

  pub fn list_tasks(&self) -> Vec<Task> {
    self.registry.list()
  }

  pub fn get_model(&self, model_id: &str) -> Result<ModelMeta, CoordinatorError> {
    self
      .models
      .get(model_id)
      .ok_or_else(|| CoordinatorError::ModelNotFound(model_id.to_string()))
  }

  pub fn list_models(&self) -> Vec<ModelMeta> {
    self.models.list()
  }

  pub async fn register_model(&self, request: RegisterModel) -> ModelMeta {
    let meta = self.models.register(request);
    self.persist_model(meta.clone()).await;
    meta
  }

  /// Client acknowledgement of a finished task; drops it from the registry.
  pub async fn acknowledge(&self, task_id: &TaskId) -> Result<Task, TaskError> {
    let task = self.registry.remove(task_id)?;
    self.notify_nodes.remove(task_id);
    if let Err(e) = self.store.delete_task(task_id.clone()).await {
      tracing::error!("Failed to delete task {} from the store: {:?}", task_id, e);
    }
    Ok(task)
  }

  /// Reloads models and unfinished tasks after a restart. Each restored task
  /// gets its deadline measured again from its last update.
  pub async fn rehydrate(self: &Arc<Self>) -> anyhow::Result<usize> {
    let models = self.store.load_models().await?;
    let restored_models = self.models.restore(models);
    tracing::info!("Restored {} model(s)", restored_models);

    let tasks = self.store.load_active().await?;
    let deadlines: Vec<(TaskId, TaskType, chrono::DateTime<Utc>)> = tasks
      .iter()
      .map(|t| (t.task_id.clone(), t.task_type, t.last_update_time))
      .collect();
    let restored = self.registry.rehydrate(tasks);

    let settings = self.settings.snapshot();
    for (task_id, task_type, last_update) in deadlines {
      let budget = match task_type {
        TaskType::LoadModel => settings.deploy_deadline(),
        _ => settings.execute_deadline(),
      };
      let elapsed = (Utc::now() - last_update).to_std().unwrap_or(Duration::ZERO);
      self.watch_deadline(task_id, budget.saturating_sub(elapsed), budget);
    }

    // Every live node is new to a coordinator that just started.
    let redeployed = self.redeploy(&self.membership.live_nodes()).await;
    if !redeployed.is_empty() {
      tracing::info!("Redeploying {} model(s) after restart", redeployed.len());
    }
    Ok(restored)
  }

  /// Starts a load for every deployed model that `added` nodes should serve
  /// but do not. Returns the ids of the load tasks started.
  pub async fn redeploy(self: &Arc<Self>, added: &[NodeId]) -> Vec<TaskId> {
    let settings = self.settings.snapshot();
    if !settings.auto_redeploy || added.is_empty() {
      return Vec::new();
    }
    let live = self.membership.live_nodes();
    let mut started = Vec::new();
    for meta in self.models.list() {
      let Some(node_ids) = redeploy_plan(&meta, added, &live, &settings) else { continue };
      if meta.auto_redeploy_retries >= settings.auto_redeploy_max_retries {
        tracing::warn!(
          "Model {} not redeployed to {:?}: {} attempt(s) already made",
          meta.model_id,
          added,
          meta.auto_redeploy_retries
        );
        continue;
      }
      if let Some(meta) = self.models.note_redeploy(&meta.model_id) {
        self.persist_model(meta).await;
      }
      match self.load_model(&meta.model_id, LoadModelRequest { node_ids, tenant_id: None }).await {
        Ok(response) => {
          tracing::info!("Redeploying model {} as task {}", meta.model_id, response.task_id);
          started.push(response.task_id);
        }
        Err(e) => tracing::warn!("Redeploy of model {} failed to start: {}", meta.model_id, e),
      }
    }
    started
  }

  /// Polls membership and redeploys models onto nodes that appear. Stops once
  /// the coordinator is dropped.
  pub fn watch_membership(self: &Arc<Self>) {
    let weak = Arc::downgrade(self);
    let mut known: BTreeSet<NodeId> = self.membership.live_nodes().into_iter().collect();
    tokio::spawn(async move {
      loop {
        let interval = match weak.upgrade() {
          Some(coordinator) => coordinator.settings.snapshot().membership_check_interval(),
          None => break,
        };
        tokio::time::sleep(interval).await;
        let Some(coordinator) = weak.upgrade() else { break };
        let live: BTreeSet<NodeId> = coordinator.membership.live_nodes().into_iter().collect();
        let added: Vec<NodeId> = live.difference(&known).cloned().collect();
        if !added.is_empty() {
          tracing::info!("Nodes joined: {:?}", added);
          coordinator.redeploy(&added).await;
        }
        known = live;
      }
    });
  }

  pub async fn load_model(
    self: &Arc<Self>,
    model_id: &str,
    request: LoadModelRequest,
  ) -> Result<LoadModelResponse, CoordinatorError> {
    let settings = self.settings.snapshot();
    let meta = self.get_model(model_id)?;
    let targets = self.eligible_nodes(&meta, request.node_ids.as_deref(), &settings)?;

    let spec = TaskSpec::new(meta.function_name, TaskType::LoadModel)
      .model(model_id)
      .dispatched(true)
      .asynchronous(true)
      .tenant(request.tenant_id);
    let task = self
      .registry
      .create_limited(spec, settings.max_running_load_tasks)
      .map_err(|running| {
        tracing::warn!("Load of {} refused with {} load task(s) running", model_id, running);
        CoordinatorError::LimitExceeded {
          task_type: TaskType::LoadModel.to_string(),
          limit: settings.max_running_load_tasks,
        }
      })?;
    let task = self.registry.assign_workers(&task.task_id, &targets)?;
    self.persist_task(task.clone()).await;
    let deploy_to_all = request.node_ids.as_ref().is_none_or(|nodes| nodes.is_empty());
    if let Some(meta) = self.models.mark_loading(model_id, &targets, deploy_to_all) {
      self.persist_model(meta).await;
    }
    tracing::info!("Loading model {} on {:?} as task {}", model_id, targets, task.task_id);

    self.watch_deadline(task.task_id.clone(), settings.deploy_deadline(), settings.deploy_deadline());
    let coordinator = self.clone();
    let response = LoadModelResponse { task_id: task.task_id.clone(), status: task.state };
    tokio::spawn(async move {
      coordinator.deploy(task, meta, targets, settings).await;
    });
    Ok(response)
  }

  fn eligible_nodes(
    &self,
    meta: &ModelMeta,
    requested: Option<&[NodeId]>,
    settings: &Settings,
  ) -> Result<Vec<NodeId>, CoordinatorError> {
    let live = self.membership.live_nodes();
    let targets: Vec<NodeId> = match requested {
      Some(requested) if !requested.is_empty() => {
        if !settings.allow_custom_deployment_plan {
          return Err(CoordinatorError::InvalidPlan("custom deployment plan is disabled".into()));
        }
        let missing: Vec<String> = meta
          .deployed_nodes
          .iter()
          .filter(|node| !requested.contains(node))
          .map(|node| node.to_string())
          .collect();
        if !missing.is_empty() {
          return Err(CoordinatorError::InvalidPlan(format!(
            "model already deployed to [{}] which the plan leaves out; unload it from those nodes first",
            missing.join(", ")
          )));
        }
        requested
          .iter()
          .filter(|node| {
            let eligible = live.contains(node);
            if !eligible {
              tracing::warn!("Requested node {} is not live, skipping", node);
            }
            eligible
          })
          .cloned()
          .collect()
      }
      _ => live,
    };
    let targets = NodesRequest::new(targets, ()).node_ids;
    if targets.is_empty() {
      return Err(CoordinatorError::NoEligibleNodes);
    }
    Ok(targets)
  }

  async fn deploy(self: Arc<Self>, task: Task, meta: ModelMeta, targets: Vec<NodeId>, settings: Arc<Settings>) {
    let task_id = task.task_id.clone();
    let input = LoadModelInput {
      model_id: meta.model_id.clone(),
      task_id: task_id.clone(),
      model_content_hash: meta.content_hash.clone(),
      node_count: targets.len(),
      coordinating_node_id: self.node_id.clone(),
      task,
    };
    let model_id = meta.model_id.clone();
    let transport = self.transport.clone();
    let acks = dispatch(
      NodesRequest::new(targets, ClusterMessage::LoadModel(input)),
      settings.node_timeout(),
      move |request: NodeRequest<ClusterMessage>| {
        let transport = transport.clone();
        let model_id = model_id.clone();
        async move { expect_received(transport.send(&request.node_id, request.payload).await, &model_id) }
      },
    )
    .await;

    let mut acknowledged = 0;
    for ack in acks {
      match ack.outcome {
        Ok(()) => acknowledged += 1,
        Err(cause) => {
          tracing::warn!("Node {} did not accept load of {}: {}", ack.node_id, meta.model_id, cause);
          if let Err(e) = self.registry.record_outcome(&task_id, &ack.node_id, Err(cause)) {
            tracing::warn!("Could not record ack failure for task {}: {}", task_id, e);
          }
        }
      }
    }

    if acknowledged == 0 {
      self.finalize(&task_id, Some("no worker node accepted the load request".into())).await;
      return;
    }
    match self.registry.transition(&task_id, TaskState::Running) {
      Ok(task) => self.persist_task(task).await,
      Err(e) => {
        tracing::info!("Task {} not moved to RUNNING: {}", task_id, e);
        return;
      }
    }
    self.maybe_finalize(&task_id).await;
  }

  /// Finalizes a RUNNING task once every participant has reported.
  pub(crate) async fn maybe_finalize(self: &Arc<Self>, task_id: &TaskId) {
    let Ok(task) = self.registry.get(task_id) else { return };
    if task.state != TaskState::Running {
      return;
    }
    match self.registry.unreported(task_id) {
      Ok(waiting) if waiting.is_empty() => self.finalize(task_id, None).await,
      Ok(waiting) => tracing::debug!("Task {} still waiting on {:?}", task_id, waiting),
      Err(e) => tracing::warn!("Task {} vanished while finalizing: {}", task_id, e),
    }
  }

  /// Records `cause` for every participant that has not reported yet.
  pub(crate) fn close_unreported(&self, task_id: &TaskId, cause: impl Fn(&NodeId) -> NodeError) {
    let Ok(waiting) = self.registry.unreported(task_id) else { return };
    for node in waiting {
      match self.registry.record_outcome(task_id, &node, Err(cause(&node))) {
        Ok(Recorded::Accepted { .. }) => tracing::debug!("Closed {} on task {}", node, task_id),
        Ok(Recorded::Ignored(reason)) => tracing::debug!("Node {} on task {} already settled: {:?}", node, task_id, reason),
        Err(e) => tracing::warn!("Could not close {} on task {}: {}", node, task_id, e),
      }
    }
  }

  /// Moves a load task to its terminal state. With `forced` the task fails
  /// with that cause regardless of the outcomes recorded so far.
  pub(crate) async fn finalize(self: &Arc<Self>, task_id: &TaskId, forced: Option<String>) {
    let outcomes = match self.registry.outcomes(task_id) {
      Ok(outcomes) => outcomes,
      Err(e) => {
        tracing::warn!("Cannot finalize task {}: {}", task_id, e);
        return;
      }
    };
    let report = aggregate(&self.membership.cluster_name(), outcomes);
    let summary = report.failure_summary();
    let (state, error) = match forced {
      Some(cause) => (
        TaskState::Failed,
        Some(match summary {
          Some(summary) => format!("{}: {}", cause, summary),
          None => cause,
        }),
      ),
      None => (report.terminal_state(&CompletionPolicy::AllNodes), summary),
    };

    let task = match self.registry.transition_with_error(task_id, state, error) {
      Ok(task) => task,
      Err(TaskError::InvalidTransition { from, .. }) if from.is_terminal() => {
        tracing::debug!("Task {} was already finalized as {}", task_id, from);
        return;
      }
      Err(e) => {
        tracing::error!("Failed to finalize task {}: {}", task_id, e);
        if let Ok(task) = self.registry.fail(task_id, e.to_string()) {
          self.persist_task(task).await;
        }
        return;
      }
    };
    tracing::info!(
      "Task {} finished {} ({} succeeded, {} failed)",
      task_id,
      task.state,
      report.successes.len(),
      report.failures.len()
    );
    self.persist_task(task.clone()).await;

    if task.task_type != TaskType::LoadModel {
      return;
    }
    let Some(model_id) = task.model_id.clone() else { return };
    let loaded = report.success_nodes();
    if let Some(meta) = self.models.record_load(&model_id, &loaded) {
      self.persist_model(meta).await;
    }
    if !loaded.is_empty() {
      let extra = self.notify_nodes.remove(task_id).map(|(_, nodes)| nodes).unwrap_or_default();
      let sync = SyncUpInput {
        added_worker_nodes: BTreeMap::from([(model_id.clone(), self.models.serving_nodes(&model_id))]),
        removed_worker_nodes: BTreeMap::new(),
      };
      self.spawn_sync_up(sync, extra);
    }
  }

  fn watch_deadline(self: &Arc<Self>, task_id: TaskId, remaining: Duration, budget: Duration) {
    let coordinator = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(remaining).await;
      coordinator.expire(&task_id, budget).await;
    });
  }

  async fn expire(self: &Arc<Self>, task_id: &TaskId, budget: Duration) {
    let Ok(task) = self.registry.get(task_id) else { return };
    if task.state.is_terminal() {
      return;
    }
    tracing::warn!("Task {} hit its {}ms deadline in state {}", task_id, budget.as_millis(), task.state);
    let after_ms = budget.as_millis() as u64;
    self.close_unreported(task_id, |node| NodeError::Timeout { node_id: node.clone(), after_ms });
    self.finalize(task_id, Some(format!("deadline of {}ms exceeded", after_ms))).await;
  }

  /// Synchronous scatter-gather unload; each node answers with a status per
  /// model.
  pub async fn unload_model(&self, request: UnloadModelRequest) -> Result<UnloadModelResponse, CoordinatorError> {
    let settings = self.settings.snapshot();
    let targets = match request.node_ids.as_deref() {
      Some(nodes) if !nodes.is_empty() => nodes.to_vec(),
      _ => {
        let deployed: BTreeSet<NodeId> =
          request.model_ids.iter().flat_map(|m| self.models.serving_nodes(m)).collect();
        if deployed.is_empty() { self.membership.live_nodes() } else { deployed.into_iter().collect() }
      }
    };
    let targets = NodesRequest::new(targets, ()).node_ids;
    if targets.is_empty() {
      return Err(CoordinatorError::NoEligibleNodes);
    }
    let function_name = request
      .model_ids
      .iter()
      .find_map(|m| self.models.get(m))
      .map(|m| m.function_name)
      .unwrap_or(FunctionName::Custom);

    let mut spec = TaskSpec::new(function_name, TaskType::UnloadModel)
      .dispatched(true)
      .tenant(request.tenant_id.clone());
    if let [model_id] = request.model_ids.as_slice() {
      spec = spec.model(model_id.clone());
    }
    let task = self.registry.create(spec);
    let task_id = task.task_id.clone();
    self.registry.assign_workers(&task_id, &targets)?;
    self.registry.transition(&task_id, TaskState::Running)?;

    let transport = self.transport.clone();
    let message = ClusterMessage::UnloadModel(UnloadModelInput { model_ids: request.model_ids.clone() });
    let outcomes = dispatch(
      NodesRequest::new(targets, message),
      settings.node_timeout(),
      move |request: NodeRequest<ClusterMessage>| {
        let transport = transport.clone();
        async move {
          match transport.send(&request.node_id, request.payload).await? {
            ClusterReply::ModelStatus(status) => status.into_outcome(),
            ClusterReply::Error(cause) => Err(cause),
            other => Err(NodeError::protocol(format!("unexpected reply to unload: {:?}", other))),
          }
        }
      },
    )
    .await;

    let report = aggregate(&self.membership.cluster_name(), outcomes);
    let policy = request.policy.unwrap_or(CompletionPolicy::AllNodes);
    let state = report.terminal_state(&policy);
    let task = self.registry.transition_with_error(&task_id, state, report.failure_summary())?;
    self.persist_task(task).await;

    let nodes = merge_statuses(&report);
    let mut removed = BTreeMap::new();
    for (model_id, statuses) in &nodes {
      let gone: Vec<NodeId> = statuses
        .iter()
        .filter(|(_, status)| status.as_str() == STATUS_UNLOADED || status.as_str() == STATUS_NOT_FOUND)
        .map(|(node, _)| node.clone())
        .collect();
      if let Some(meta) = self.models.record_unload(model_id, &gone) {
        self.persist_model(meta).await;
      }
      removed.insert(model_id.clone(), gone);
    }
    if removed.values().any(|nodes| !nodes.is_empty()) {
      self.spawn_sync_up(
        SyncUpInput { added_worker_nodes: BTreeMap::new(), removed_worker_nodes: removed },
        BTreeSet::new(),
      );
    }

    tracing::info!("Unload task {} finished {}", task_id, state);
    Ok(UnloadModelResponse { task_id, state, nodes, report })
  }

  /// Runs a train/predict/execute request on one node and waits for it.
  pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, CoordinatorError> {
    let settings = self.settings.snapshot();
    if let Some(model_id) = &request.model_id {
      self.get_model(model_id)?;
    }
    let target = self.execution_target(&request)?;

    let mut spec = TaskSpec::new(request.function_name, request.task_type)
      .dispatched(target != self.node_id)
      .tenant(request.tenant_id.clone());
    if let Some(model_id) = &request.model_id {
      spec = spec.model(model_id.clone());
    }
    let task = self.registry.create(spec);
    let task_id = task.task_id.clone();
    self.registry.assign_workers(&task_id, std::slice::from_ref(&target))?;
    let task = self.registry.transition(&task_id, TaskState::Running)?;
    self.persist_task(task).await;

    let input = ExecuteInput {
      task_id: task_id.clone(),
      function_name: request.function_name,
      task_type: request.task_type,
      model_id: request.model_id.clone(),
      input: request.input,
    };
    let transport = self.transport.clone();
    let outcomes = dispatch(
      NodesRequest::new(vec![target], ClusterMessage::Execute(input)),
      settings.execute_deadline(),
      move |request: NodeRequest<ClusterMessage>| {
        let transport = transport.clone();
        async move {
          match transport.send(&request.node_id, request.payload).await? {
            ClusterReply::Output(output) => Ok(output),
            ClusterReply::Error(cause) => Err(cause),
            other => Err(NodeError::protocol(format!("unexpected reply to execute: {:?}", other))),
          }
        }
      },
    )
    .await;

    let report = aggregate(&self.membership.cluster_name(), outcomes);
    let state = report.terminal_state(&CompletionPolicy::AllNodes);
    let task = self.registry.transition_with_error(&task_id, state, report.failure_summary())?;
    self.persist_task(task).await;

    let output = report.successes.first().map(|s| s.value.output.clone());
    Ok(ExecuteResponse { task_id, state, output, report })
  }

  fn execution_target(&self, request: &ExecuteRequest) -> Result<NodeId, CoordinatorError> {
    if let Some(node) = &request.node_id {
      return Ok(node.clone());
    }
    let Some(model_id) = &request.model_id else {
      return Ok(self.node_id.clone());
    };
    let live = self.membership.live_nodes();
    let serving: Vec<NodeId> = self
      .models
      .serving_nodes(model_id)
      .into_iter()
      .filter(|node| live.contains(node))
      .collect();
    if serving.is_empty() {
      return Err(CoordinatorError::NoEligibleNodes);
    }
    let next = self.next_target.fetch_add(1, Ordering::Relaxed);
    Ok(serving[next % serving.len()].clone())
  }

  fn spawn_sync_up(&self, sync: SyncUpInput, extra: BTreeSet<NodeId>) {
    let mut nodes = self.membership.live_nodes();
    nodes.extend(extra);
    let timeout = self.settings.snapshot().node_timeout();
    let transport = self.transport.clone();
    tokio::spawn(async move {
      let outcomes = dispatch(
        NodesRequest::new(nodes, ClusterMessage::SyncUp(sync)),
        timeout,
        move |request: NodeRequest<ClusterMessage>| {
          let transport = transport.clone();
          async move {
            match transport.send(&request.node_id, request.payload).await? {
              ClusterReply::Ack => Ok(()),
              ClusterReply::Error(cause) => Err(cause),
              other => Err(NodeError::protocol(format!("unexpected reply to sync-up: {:?}", other))),
            }
          }
        },
      )
      .await;
      let failed = outcomes.iter().filter(|o| o.outcome.is_err()).count();
      tracing::debug!("Sync-up reached {} node(s), {} failed", outcomes.len() - failed, failed);
    });
  }

  pub(crate) async fn persist_task(&self, task: Task) {
    let task_id = task.task_id.clone();
    if let Err(e) = self.store.save_task(task).await {
      tracing::error!("Failed to persist task {}: {:?}", task_id, e);
    }
  }

  pub(crate) async fn persist_model(&self, meta: ModelMeta) {
    let model_id = meta.model_id.clone();
    if let Err(e) = self.store.save_model(meta).await {
      tracing::error!("Failed to persist model {}: {:?}", model_id, e);
    }
  }
}

fn expect_received(reply: Result<ClusterReply, NodeError>, model_id: &str) -> Result<(), NodeError> {
  match reply? {
    ClusterReply::ModelStatus(status) => match status.statuses.get(model_id) {
      Some(_) => Ok(()),
      None => Err(NodeError::protocol(format!("node {} did not acknowledge model {}", status.node_id, model_id))),
    },
    ClusterReply::Error(cause) => Err(cause),
    other => Err(NodeError::protocol(format!("unexpected reply to load: {:?}", other))),
  }
}

/// Which nodes a redeploy of `meta` should target, given the nodes that just
/// joined. `None` means nothing to do; `Some(None)` means every live node.
fn redeploy_plan(
  meta: &ModelMeta,
  added: &[NodeId],
  live: &[NodeId],
  settings: &Settings,
) -> Option<Option<Vec<NodeId>>> {
  if !matches!(meta.state, ModelClusterState::Loaded | ModelClusterState::PartiallyLoaded) {
    return None;
  }
  let wanted = |candidates: &[NodeId]| {
    added
      .iter()
      .any(|node| candidates.contains(node) && live.contains(node) && !meta.deployed_nodes.contains(node))
  };
  if meta.deploy_to_all_nodes || !settings.allow_custom_deployment_plan {
    return wanted(live).then_some(None);
  }
  if !wanted(&meta.planning_worker_nodes) {
    return None;
  }
  let plan: BTreeSet<NodeId> = meta
    .planning_worker_nodes
    .iter()
    .chain(meta.deployed_nodes.iter())
    .cloned()
    .collect();
  Some(Some(plan.into_iter().collect()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn nodes(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
  }

  fn deployed(on: &[&str], planned: &[&str], deploy_to_all_nodes: bool) -> ModelMeta {
    ModelMeta {
      model_id: "m1".into(),
      name: "embedder".into(),
      version: "1".into(),
      function_name: FunctionName::TextEmbedding,
      content_hash: "h".into(),
      size_bytes: 1,
      config: None,
      state: ModelClusterState::PartiallyLoaded,
      deployed_nodes: nodes(on),
      planning_worker_node_count: planned.len(),
      planning_worker_nodes: nodes(planned),
      deploy_to_all_nodes,
      auto_redeploy_retries: 0,
      last_update_time: Utc::now(),
    }
  }

  #[test]
  fn deploy_to_all_follows_every_new_node() {
    let meta = deployed(&["a", "b"], &["a", "b"], true);
    let live = nodes(&["a", "b", "c"]);
    let settings = Settings::default();

    assert_eq!(redeploy_plan(&meta, &nodes(&["c"]), &live, &settings), Some(None));
    assert_eq!(redeploy_plan(&meta, &nodes(&["b"]), &live, &settings), None);
    assert_eq!(redeploy_plan(&meta, &nodes(&["z"]), &live, &settings), None);
  }

  #[test]
  fn custom_plan_only_takes_back_planned_nodes() {
    let meta = deployed(&["a"], &["a", "b"], false);
    let live = nodes(&["a", "b", "c"]);
    let settings = Settings::default();

    assert_eq!(redeploy_plan(&meta, &nodes(&["c"]), &live, &settings), None);
    assert_eq!(redeploy_plan(&meta, &nodes(&["b", "c"]), &live, &settings), Some(Some(nodes(&["a", "b"]))));

    let no_custom = Settings { allow_custom_deployment_plan: false, ..Settings::default() };
    assert_eq!(redeploy_plan(&meta, &nodes(&["c"]), &live, &no_custom), Some(None));
  }

  #[test]
  fn models_not_serving_are_left_alone() {
    let mut meta = deployed(&[], &["a"], true);
    meta.state = ModelClusterState::Unloaded;
    assert_eq!(redeploy_plan(&meta, &nodes(&["a"]), &nodes(&["a"]), &Settings::default()), None);

    meta.state = ModelClusterState::Loading;
    assert_eq!(redeploy_plan(&meta, &nodes(&["a"]), &nodes(&["a"]), &Settings::default()), None);
  }
}
