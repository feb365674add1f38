use std::convert::Infallible;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::SettingsPatch;
use crate::coordinator::Coordinator;
use crate::deployment::WorkerService;
use crate::error::{CoordinatorError, NodeError, TaskError};
use crate::node::NodeService;

pub mod models;
pub mod sse;
pub mod tasks;

pub fn routes(
  coordinator: Arc<Coordinator>,
  worker: Arc<WorkerService>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  models::model_routes(coordinator.clone(), worker)
    .or(tasks::task_routes(coordinator.clone()))
    .or(sse::sse_route(coordinator.clone()))
    .or(settings_routes(coordinator))
    .recover(handle_rejection)
}

/// Routes for a node service; a node without the coordinator role has none.
/// Takes the service by value so the filter owns everything it serves.
pub fn node_routes(node: NodeService) -> Option<impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone> {
  let worker = node.worker_service().clone();
  node.coordinator().cloned().map(move |coordinator| routes(coordinator, worker))
}

fn settings_routes(
  coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let get = warp::path("settings")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_coordinator(coordinator.clone()))
    .map(|coordinator: Arc<Coordinator>| warp::reply::json(&*coordinator.settings().snapshot()));
  let put = warp::path("settings")
    .and(warp::path::end())
    .and(warp::put())
    .and(warp::body::json())
    .and(with_coordinator(coordinator))
    .map(|patch: SettingsPatch, coordinator: Arc<Coordinator>| {
      warp::reply::json(&*coordinator.settings().update(patch))
    });
  get.or(put)
}

pub(crate) fn with_coordinator(
  coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = (Arc<Coordinator>,), Error = Infallible> + Clone {
  warp::any().map(move || coordinator.clone())
}

pub(crate) fn with_worker(
  worker: Arc<WorkerService>,
) -> impl Filter<Extract = (Arc<WorkerService>,), Error = Infallible> + Clone {
  warp::any().map(move || worker.clone())
}

static ID_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,128}$").ok());

pub(crate) fn valid_id(id: &str) -> bool {
  ID_PATTERN.as_ref().is_some_and(|re| re.is_match(id))
}

pub(crate) fn check_id(kind: &str, id: &str) -> Result<(), Rejection> {
  if valid_id(id) {
    Ok(())
  } else {
    Err(warp::reject::custom(ApiError::bad_request(format!("invalid {} id", kind))))
  }
}

#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Self {
    Self { status: StatusCode::BAD_REQUEST, message: message.into() }
  }
}

impl From<TaskError> for ApiError {
  fn from(e: TaskError) -> Self {
    let status = match e {
      TaskError::UnknownTask(_) => StatusCode::NOT_FOUND,
      TaskError::InvalidTransition { .. } | TaskError::NotTerminal { .. } => StatusCode::CONFLICT,
    };
    Self { status, message: e.to_string() }
  }
}

impl From<CoordinatorError> for ApiError {
  fn from(e: CoordinatorError) -> Self {
    match e {
      CoordinatorError::Task(e) => e.into(),
      CoordinatorError::ModelNotFound(_) => Self { status: StatusCode::NOT_FOUND, message: e.to_string() },
      CoordinatorError::NoEligibleNodes => Self { status: StatusCode::SERVICE_UNAVAILABLE, message: e.to_string() },
      CoordinatorError::LimitExceeded { .. } => Self { status: StatusCode::TOO_MANY_REQUESTS, message: e.to_string() },
      CoordinatorError::InvalidPlan(_) => Self { status: StatusCode::CONFLICT, message: e.to_string() },
      CoordinatorError::Protocol(_) => Self { status: StatusCode::BAD_REQUEST, message: e.to_string() },
    }
  }
}

impl From<NodeError> for ApiError {
  fn from(e: NodeError) -> Self {
    let status = match e {
      NodeError::Rejected { .. } => StatusCode::TOO_MANY_REQUESTS,
      NodeError::Timeout { .. } | NodeError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self { status, message: e.to_string() }
  }
}

pub(crate) fn reject(e: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(e.into())
}

#[derive(Serialize)]
struct ErrorBody {
  status: u16,
  error: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status, e.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  let body = warp::reply::json(&ErrorBody { status: status.as_u16(), error: message });
  Ok(warp::reply::with_status(body, status))
}

#[cfg(test)]
pub(crate) mod test_support {
  use std::sync::Arc;

  use crate::codec::WireVersion;
  use crate::config::SettingsHandle;
  use crate::engine::MemoryModelSource;
  use crate::models::NodeId;
  use crate::node::{NodeBuilder, NodeService};
  use crate::transport::LocalCluster;

  pub fn single_node() -> (NodeService, Arc<MemoryModelSource>) {
    let cluster = LocalCluster::new("test-cluster");
    let node_id = NodeId::from("n1");
    let source = Arc::new(MemoryModelSource::new());
    let node = NodeBuilder::new(node_id.clone(), node_id.clone())
      .settings(SettingsHandle::default())
      .source(source.clone())
      .build(cluster.clone(), Arc::new(cluster.membership(node_id.clone())));
    cluster.join(node_id, Arc::new(node.clone()), WireVersion::CURRENT);
    (node, source)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_are_restricted() {
    assert!(valid_id("m1"));
    assert!(valid_id("0b3c-41.v2_x"));
    assert!(!valid_id("../etc"));
    assert!(!valid_id(""));
    assert!(!valid_id("a b"));
  }

  #[tokio::test]
  async fn settings_can_be_patched() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();

    let res = warp::test::request()
      .method("PUT")
      .path("/settings")
      .json(&serde_json::json!({"node_timeout_ms": 250}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), 200);

    let res = warp::test::request().path("/settings").reply(&api).await;
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["node_timeout_ms"], 250);
  }

  #[tokio::test]
  async fn unknown_path_is_404_json() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();
    let res = warp::test::request().path("/nope").reply(&api).await;
    assert_eq!(res.status(), 404);
  }
}
