use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use warp::Filter;

use crate::coordinator::{Coordinator, ExecuteRequest};
use crate::models::{TaskId, TaskState};
use crate::routes::{check_id, reject, with_coordinator};

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: TaskId,
  pub status: TaskState,
  pub sse_url: String,
}

pub fn task_routes(coordinator: Arc<Coordinator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let execute = warp::path!("_execute")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_execute);

  let get = warp::path!("tasks" / String)
    .and(warp::get())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_get);

  let delete = warp::path!("tasks" / String)
    .and(warp::delete())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_delete);

  let list = warp::path!("tasks")
    .and(warp::get())
    .and(with_coordinator(coordinator))
    .map(|coordinator: Arc<Coordinator>| warp::reply::json(&coordinator.list_tasks()));

  execute.or(get).or(delete).or(list)
}

async fn handle_execute(request: ExecuteRequest, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  if let Some(model_id) = &request.model_id {
    check_id("model", model_id)?;
  }
  let response = coordinator.execute(request).await.map_err(reject)?;
  info!("Execute task {} finished {}", response.task_id, response.state);
  Ok(warp::reply::json(&response))
}

async fn handle_get(task_id: String, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  check_id("task", &task_id)?;
  let task = coordinator.get_task(&TaskId(task_id)).map_err(reject)?;
  let response = TaskResponse {
    sse_url: format!("/sse?task_id={}", task.task_id),
    task_id: task.task_id,
    status: task.state,
  };
  Ok(warp::reply::json(&serde_json::json!({ "task": response, "error": task.error })))
}

async fn handle_delete(task_id: String, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  check_id("task", &task_id)?;
  let task = coordinator.acknowledge(&TaskId(task_id)).await.map_err(reject)?;
  info!("Task {} acknowledged and removed", task.task_id);
  Ok(warp::reply::json(&task))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::routes::{node_routes, test_support};

  #[tokio::test]
  async fn unknown_task_is_404() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();
    let res = warp::test::request().path("/tasks/missing").reply(&api).await;
    assert_eq!(res.status(), 404);
  }

  #[tokio::test]
  async fn execute_runs_locally_and_can_be_acknowledged() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();

    let res = warp::test::request()
      .method("POST")
      .path("/_execute")
      .json(&serde_json::json!({
        "function_name": "KMEANS",
        "task_type": "TRAINING",
        "input": {"rows": [[1.0], [2.0]]}
      }))
      .reply(&api)
      .await;
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    // No KMEANS handler is registered by default, so the node reports a failure.
    assert_eq!(body["state"], "FAILED");
    assert_eq!(body["report"]["failures"][0]["node_id"], "n1");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let res = warp::test::request().path(&format!("/tasks/{}", task_id)).reply(&api).await;
    let task: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(task["task"]["status"], "FAILED");

    let res = warp::test::request().method("DELETE").path(&format!("/tasks/{}", task_id)).reply(&api).await;
    assert_eq!(res.status(), 200);
    let res = warp::test::request().path(&format!("/tasks/{}", task_id)).reply(&api).await;
    assert_eq!(res.status(), 404);
  }
}
