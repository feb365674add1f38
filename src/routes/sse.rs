use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use warp::Filter;

use crate::coordinator::Coordinator;
use crate::models::TaskId;
use crate::routes::{ApiError, check_id, with_coordinator};

pub fn sse_route(coordinator: Arc<Coordinator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_coordinator(coordinator))
    .and_then(handle_sse)
}

/// Streams the task's state every second until it is terminal. The stream
/// ends after the terminal event or when the task is gone.
async fn handle_sse(query: HashMap<String, String>, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query
    .get("task_id")
    .ok_or_else(|| warp::reject::custom(ApiError::bad_request("Missing task_id")))?
    .clone();
  check_id("task", &task_id)?;
  let task_id = TaskId(task_id);

  let interval = IntervalStream::new(tokio::time::interval(Duration::from_secs(1)));
  let mut finished = false;
  let stream = interval
    .map(move |_| coordinator.get_task(&task_id).ok())
    .take_while(move |task| {
      let keep = !finished && task.is_some();
      finished = task.as_ref().is_some_and(|t| t.state.is_terminal());
      keep
    })
    .filter_map(|task| task)
    .map(|task| {
      let event = warp::sse::Event::default()
        .event(task.state.as_str())
        .data(json!({"task_id": task.task_id, "status": task.state, "error": task.error}).to_string());
      Ok::<_, Infallible>(event)
    });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
