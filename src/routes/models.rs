use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use warp::Filter;
use warp::hyper::body::Bytes;

use crate::coordinator::{Coordinator, LoadModelRequest, UnloadModelRequest};
use crate::deployment::{UploadModel, WorkerService};
use crate::model_index::RegisterModel;
use crate::models::FunctionName;
use crate::routes::{ApiError, check_id, reject, with_coordinator, with_worker};

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
  pub name: String,
  pub version: String,
  pub function_name: FunctionName,
}

pub fn model_routes(
  coordinator: Arc<Coordinator>,
  worker: Arc<WorkerService>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let register = warp::path!("models" / "_register")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_register);

  let upload = warp::path!("models" / "_upload")
    .and(warp::post())
    .and(warp::query::<UploadQuery>())
    .and(warp::body::content_length_limit(256 * 1024 * 1024))
    .and(warp::body::bytes())
    .and(with_worker(worker))
    .and_then(handle_upload);

  let unload = warp::path!("models" / "_unload")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_unload);

  let load = warp::path!("models" / String / "_load")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_load);

  let get = warp::path!("models" / String)
    .and(warp::get())
    .and(with_coordinator(coordinator.clone()))
    .and_then(handle_get);

  let list = warp::path!("models")
    .and(warp::get())
    .and(with_coordinator(coordinator))
    .map(|coordinator: Arc<Coordinator>| warp::reply::json(&coordinator.list_models()));

  register.or(upload).or(unload).or(load).or(get).or(list)
}

async fn handle_register(request: RegisterModel, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  if let Some(model_id) = &request.model_id {
    check_id("model", model_id)?;
  }
  if request.content_hash.is_empty() {
    return Err(warp::reject::custom(ApiError::bad_request("content_hash is required")));
  }
  let meta = coordinator.register_model(request).await;
  Ok(warp::reply::json(&meta))
}

async fn handle_upload(
  query: UploadQuery,
  body: Bytes,
  worker: Arc<WorkerService>,
) -> Result<impl warp::Reply, warp::Rejection> {
  if body.is_empty() {
    return Err(warp::reject::custom(ApiError::bad_request("model content is empty")));
  }
  let request = UploadModel {
    name: query.name,
    version: query.version,
    function_name: query.function_name,
    config: None,
  };
  let upload = worker.upload_model(request, body.to_vec()).await.map_err(reject)?;
  info!("Model {} uploaded ({} bytes)", upload.model_id, upload.size_bytes);
  Ok(warp::reply::json(&upload))
}

async fn handle_load(
  model_id: String,
  request: LoadModelRequest,
  coordinator: Arc<Coordinator>,
) -> Result<impl warp::Reply, warp::Rejection> {
  check_id("model", &model_id)?;
  let response = coordinator.load_model(&model_id, request).await.map_err(reject)?;
  Ok(warp::reply::json(&response))
}

async fn handle_unload(request: UnloadModelRequest, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  if request.model_ids.is_empty() {
    return Err(warp::reject::custom(ApiError::bad_request("model_ids must not be empty")));
  }
  for model_id in &request.model_ids {
    check_id("model", model_id)?;
  }
  let response = coordinator.unload_model(request).await.map_err(reject)?;
  Ok(warp::reply::json(&response))
}

async fn handle_get(model_id: String, coordinator: Arc<Coordinator>) -> Result<impl warp::Reply, warp::Rejection> {
  check_id("model", &model_id)?;
  let meta = coordinator.get_model(&model_id).map_err(reject)?;
  Ok(warp::reply::json(&meta))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::content_hash;
  use crate::models::ModelMeta;
  use crate::routes::{node_routes, test_support};

  #[tokio::test]
  async fn register_then_get() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();

    let res = warp::test::request()
      .method("POST")
      .path("/models/_register")
      .json(&serde_json::json!({
        "model_id": "m1",
        "name": "embedder",
        "version": "1",
        "function_name": "TEXT_EMBEDDING",
        "content_hash": "abc"
      }))
      .reply(&api)
      .await;
    assert_eq!(res.status(), 200);

    let res = warp::test::request().path("/models/m1").reply(&api).await;
    let meta: ModelMeta = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(meta.content_hash, "abc");
  }

  #[tokio::test]
  async fn missing_model_is_404() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();

    let res = warp::test::request().path("/models/ghost").reply(&api).await;
    assert_eq!(res.status(), 404);

    let res = warp::test::request()
      .method("POST")
      .path("/models/ghost/_load")
      .json(&serde_json::json!({}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), 404);
  }

  #[tokio::test]
  async fn upload_registers_model_with_its_hash() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();

    let res = warp::test::request()
      .method("POST")
      .path("/models/_upload?name=embedder&version=2&function_name=TEXT_EMBEDDING")
      .body("weights")
      .reply(&api)
      .await;
    assert_eq!(res.status(), 200);
    let upload: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    let model_id = upload["model_id"].as_str().unwrap();

    let meta = node.coordinator().unwrap().get_model(model_id).unwrap();
    assert_eq!(meta.content_hash, content_hash(b"weights"));
    assert_eq!(meta.size_bytes, 7);
  }

  #[tokio::test]
  async fn unload_requires_model_ids() {
    let (node, _) = test_support::single_node();
    let api = node_routes(node.clone()).unwrap();
    let res = warp::test::request()
      .method("POST")
      .path("/models/_unload")
      .json(&serde_json::json!({"model_ids": []}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), 400);
  }
}
