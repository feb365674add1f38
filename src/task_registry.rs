//! In-memory task registry owned by the coordinating node.
//!
//! Every mutation of one task goes through that task's map entry, so calls for
//! the same task are serialized while different tasks proceed in parallel.
//! Nothing in here performs I/O; persistence happens after a call returns.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::dispatch::NodeResponse;
use crate::error::{NodeError, TaskError};
use crate::models::{NodeId, Task, TaskId, TaskSpec, TaskState, TaskType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
  Terminal,
  NotParticipant,
  Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
  Accepted { reported: usize, expected: usize, state: TaskState },
  Ignored(IgnoreReason),
}

#[derive(Debug)]
struct TaskEntry {
  task: Task,
  outcomes: BTreeMap<NodeId, Result<String, NodeError>>,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
  tasks: DashMap<TaskId, TaskEntry>,
  /// Held across count-then-insert so limited creates cannot overshoot.
  admission: Mutex<()>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates the task only while fewer than `limit` tasks of its type are
  /// still running. Returns the running count when the limit is reached.
  pub fn create_limited(&self, spec: TaskSpec, limit: usize) -> Result<Task, usize> {
    let _admission = self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let running = self.running_count(spec.task_type);
    if running >= limit {
      return Err(running);
    }
    Ok(self.create(spec))
  }

  pub fn create(&self, spec: TaskSpec) -> Task {
    let now = Utc::now();
    let task = Task {
      task_id: TaskId::new(),
      request_id: Uuid::new_v4().to_string(),
      function_name: spec.function_name,
      task_type: spec.task_type,
      model_id: spec.model_id,
      state: TaskState::Created,
      dispatched: spec.dispatched,
      is_async: spec.is_async,
      worker_node_ids: Vec::new(),
      error: None,
      create_time: now,
      last_update_time: now,
      tenant_id: spec.tenant_id,
    };
    self.tasks.insert(
      task.task_id.clone(),
      TaskEntry { task: task.clone(), outcomes: BTreeMap::new() },
    );
    tracing::debug!("Created task {} ({}, {})", task.task_id, task.task_type, task.function_name);
    task
  }

  pub fn get(&self, task_id: &TaskId) -> Result<Task, TaskError> {
    self
      .tasks
      .get(task_id)
      .map(|entry| entry.task.clone())
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))
  }

  pub fn contains(&self, task_id: &TaskId) -> bool {
    self.tasks.contains_key(task_id)
  }

  pub fn transition(&self, task_id: &TaskId, target: TaskState) -> Result<Task, TaskError> {
    self.transition_with_error(task_id, target, None)
  }

  pub fn fail(&self, task_id: &TaskId, cause: impl Into<String>) -> Result<Task, TaskError> {
    self.transition_with_error(task_id, TaskState::Failed, Some(cause.into()))
  }

  pub fn transition_with_error(
    &self,
    task_id: &TaskId,
    target: TaskState,
    error: Option<String>,
  ) -> Result<Task, TaskError> {
    let mut entry = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))?;
    let from = entry.task.state;
    if !from.can_transition_to(target) {
      return Err(TaskError::InvalidTransition { task_id: task_id.clone(), from, to: target });
    }
    entry.task.state = target;
    entry.task.last_update_time = Utc::now();
    if error.is_some() {
      entry.task.error = error;
    }
    tracing::debug!("Task {} {} -> {}", task_id, from, target);
    Ok(entry.task.clone())
  }

  pub fn assign_workers(&self, task_id: &TaskId, nodes: &[NodeId]) -> Result<Task, TaskError> {
    let mut entry = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))?;
    entry.task.worker_node_ids = nodes.to_vec();
    entry.task.last_update_time = Utc::now();
    Ok(entry.task.clone())
  }

  /// Stores one worker's outcome. Late, foreign and repeated reports are
  /// ignored rather than treated as errors.
  pub fn record_outcome(
    &self,
    task_id: &TaskId,
    node_id: &NodeId,
    outcome: Result<String, NodeError>,
  ) -> Result<Recorded, TaskError> {
    let mut entry = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))?;
    if entry.task.state.is_terminal() {
      return Ok(Recorded::Ignored(IgnoreReason::Terminal));
    }
    if !entry.task.worker_node_ids.contains(node_id) {
      return Ok(Recorded::Ignored(IgnoreReason::NotParticipant));
    }
    if entry.outcomes.contains_key(node_id) {
      return Ok(Recorded::Ignored(IgnoreReason::Duplicate));
    }
    entry.outcomes.insert(node_id.clone(), outcome);
    entry.task.last_update_time = Utc::now();
    Ok(Recorded::Accepted {
      reported: entry.outcomes.len(),
      expected: entry.task.worker_node_ids.len(),
      state: entry.task.state,
    })
  }

  pub fn outcomes(&self, task_id: &TaskId) -> Result<Vec<NodeResponse<String>>, TaskError> {
    let entry = self
      .tasks
      .get(task_id)
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))?;
    Ok(
      entry
        .outcomes
        .iter()
        .map(|(node_id, outcome)| NodeResponse { node_id: node_id.clone(), outcome: outcome.clone() })
        .collect(),
    )
  }

  /// Participants that have not reported yet.
  pub fn unreported(&self, task_id: &TaskId) -> Result<Vec<NodeId>, TaskError> {
    let entry = self
      .tasks
      .get(task_id)
      .ok_or_else(|| TaskError::UnknownTask(task_id.clone()))?;
    Ok(
      entry
        .task
        .worker_node_ids
        .iter()
        .filter(|node| !entry.outcomes.contains_key(*node))
        .cloned()
        .collect(),
    )
  }

  /// Drops a finished task. Removing a live task is a caller bug and fails.
  pub fn remove(&self, task_id: &TaskId) -> Result<Task, TaskError> {
    let state = self.get(task_id)?.state;
    match self.tasks.remove_if(task_id, |_, entry| entry.task.state.is_terminal()) {
      Some((_, entry)) => {
        tracing::debug!("Removed task {}", task_id);
        Ok(entry.task)
      }
      None => Err(TaskError::NotTerminal { task_id: task_id.clone(), state }),
    }
  }

  pub fn list(&self) -> Vec<Task> {
    let mut tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.task.clone()).collect();
    tasks.sort_by(|a, b| a.create_time.cmp(&b.create_time));
    tasks
  }

  pub fn running_count(&self, task_type: TaskType) -> usize {
    self
      .tasks
      .iter()
      .filter(|entry| entry.task.task_type == task_type && !entry.task.state.is_terminal())
      .count()
  }

  /// Loads tasks read back from the durable store. Tasks already cached win.
  pub fn rehydrate(&self, tasks: Vec<Task>) -> usize {
    let mut restored = 0;
    for task in tasks {
      if self.tasks.contains_key(&task.task_id) {
        continue;
      }
      self
        .tasks
        .insert(task.task_id.clone(), TaskEntry { task, outcomes: BTreeMap::new() });
      restored += 1;
    }
    tracing::info!("Rehydrated {} task(s) from the task store", restored);
    restored
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::FunctionName;
  use std::sync::{Arc, Barrier};
  use tokio_test::{assert_err, assert_ok};

  fn load_spec() -> TaskSpec {
    TaskSpec::new(FunctionName::TextEmbedding, TaskType::LoadModel)
      .model("m1")
      .dispatched(true)
      .asynchronous(true)
  }

  #[test]
  fn create_starts_in_created_with_fresh_ids() {
    let registry = TaskRegistry::new();
    let a = registry.create(load_spec());
    let b = registry.create(load_spec());

    assert_eq!(a.state, TaskState::Created);
    assert_ne!(a.task_id, b.task_id);
    assert_ne!(a.request_id, b.request_id);
    assert!(a.dispatched && a.is_async);
    assert_eq!(registry.len(), 2);
  }

  #[test]
  fn transition_walks_the_state_machine() {
    let registry = TaskRegistry::new();
    let task = registry.create(load_spec());

    let running = assert_ok!(registry.transition(&task.task_id, TaskState::Running));
    assert_eq!(running.state, TaskState::Running);
    assert!(running.last_update_time >= task.last_update_time);

    let done = assert_ok!(registry.transition(&task.task_id, TaskState::Completed));
    assert_eq!(done.state, TaskState::Completed);
  }

  #[test]
  fn terminal_tasks_reject_further_transitions() {
    let registry = TaskRegistry::new();
    let task = registry.create(load_spec());
    assert_ok!(registry.fail(&task.task_id, "dispatch failed"));

    for target in [TaskState::Running, TaskState::Completed, TaskState::Failed] {
      let err = assert_err!(registry.transition(&task.task_id, target));
      assert!(matches!(err, TaskError::InvalidTransition { from: TaskState::Failed, .. }));
    }
    assert_eq!(registry.get(&task.task_id).unwrap().error.as_deref(), Some("dispatch failed"));
  }

  #[test]
  fn unknown_task_is_reported() {
    let registry = TaskRegistry::new();
    let missing = TaskId::from("missing");

    assert_eq!(registry.get(&missing), Err(TaskError::UnknownTask(missing.clone())));
    assert_eq!(
      registry.transition(&missing, TaskState::Running),
      Err(TaskError::UnknownTask(missing.clone()))
    );
  }

  #[test]
  fn remove_requires_terminal_state() {
    let registry = TaskRegistry::new();
    let task = registry.create(load_spec());

    let err = assert_err!(registry.remove(&task.task_id));
    assert!(matches!(err, TaskError::NotTerminal { state: TaskState::Created, .. }));
    assert!(registry.contains(&task.task_id));

    registry.transition(&task.task_id, TaskState::Running).unwrap();
    registry.transition(&task.task_id, TaskState::Completed).unwrap();
    assert_ok!(registry.remove(&task.task_id));
    assert!(!registry.contains(&task.task_id));
  }

  #[test]
  fn concurrent_transitions_on_one_task_have_one_winner() {
    let registry = Arc::new(TaskRegistry::new());
    let task = registry.create(load_spec());
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
      .map(|_| {
        let registry = registry.clone();
        let barrier = barrier.clone();
        let task_id = task.task_id.clone();
        std::thread::spawn(move || {
          barrier.wait();
          registry.transition(&task_id, TaskState::Running)
        })
      })
      .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(matches!(
      loser,
      TaskError::InvalidTransition { from: TaskState::Running, to: TaskState::Running, .. }
    ));
  }

  #[test]
  fn limited_create_admits_one_of_many_racers() {
    let registry = Arc::new(TaskRegistry::new());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let registry = registry.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
          barrier.wait();
          registry.create_limited(load_spec(), 1)
        })
      })
      .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|running| *running == 1));
    assert_eq!(registry.running_count(TaskType::LoadModel), 1);
  }

  #[test]
  fn finished_tasks_free_their_slot() {
    let registry = TaskRegistry::new();
    let first = registry.create_limited(load_spec(), 1).unwrap();
    assert_eq!(registry.create_limited(load_spec(), 1).unwrap_err(), 1);

    registry.fail(&first.task_id, "no worker accepted").unwrap();
    assert!(registry.create_limited(load_spec(), 1).is_ok());
  }

  #[test]
  fn outcomes_are_recorded_once_per_participant() {
    let registry = TaskRegistry::new();
    let task = registry.create(load_spec());
    let nodes = vec![NodeId::from("a"), NodeId::from("b")];
    registry.assign_workers(&task.task_id, &nodes).unwrap();

    let first = registry.record_outcome(&task.task_id, &nodes[0], Ok("loaded".into())).unwrap();
    assert_eq!(first, Recorded::Accepted { reported: 1, expected: 2, state: TaskState::Created });

    let again = registry.record_outcome(&task.task_id, &nodes[0], Ok("loaded".into())).unwrap();
    assert_eq!(again, Recorded::Ignored(IgnoreReason::Duplicate));

    let stranger = registry.record_outcome(&task.task_id, &NodeId::from("z"), Ok("loaded".into())).unwrap();
    assert_eq!(stranger, Recorded::Ignored(IgnoreReason::NotParticipant));

    assert_eq!(registry.unreported(&task.task_id).unwrap(), vec![nodes[1].clone()]);
  }

  #[test]
  fn outcomes_after_terminal_are_discarded() {
    let registry = TaskRegistry::new();
    let task = registry.create(load_spec());
    let node = NodeId::from("a");
    registry.assign_workers(&task.task_id, std::slice::from_ref(&node)).unwrap();
    registry.fail(&task.task_id, "deadline").unwrap();

    let late = registry.record_outcome(&task.task_id, &node, Ok("loaded".into())).unwrap();
    assert_eq!(late, Recorded::Ignored(IgnoreReason::Terminal));
    assert!(registry.outcomes(&task.task_id).unwrap().is_empty());
    assert_eq!(registry.get(&task.task_id).unwrap().state, TaskState::Failed);
  }

  #[test]
  fn rehydrate_keeps_cached_tasks() {
    let registry = TaskRegistry::new();
    let cached = registry.create(load_spec());
    let mut stored = cached.clone();
    stored.state = TaskState::Failed;
    let mut other = cached.clone();
    other.task_id = TaskId::from("from-store");

    assert_eq!(registry.rehydrate(vec![stored, other]), 1);
    assert_eq!(registry.get(&cached.task_id).unwrap().state, TaskState::Created);
    assert!(registry.contains(&TaskId::from("from-store")));
    assert_eq!(registry.running_count(TaskType::LoadModel), 2);
  }
}
