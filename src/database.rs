use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::migrate::Migrator;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::models::{ModelMeta, Task, TaskId};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url)
    .await
    .context("Failed to connect to database.")?;

  MIGRATOR.run(&pool)
    .await
    .context("Failed to run database migrations.")?;
  info!("Database migrations complete");
  Ok(pool)
}

/// Durable copy of the coordinator's registry, read back on restart.
pub trait TaskStore: Send + Sync {
  fn save_task(&self, task: Task) -> BoxFuture<'_, Result<()>>;
  fn delete_task(&self, task_id: TaskId) -> BoxFuture<'_, Result<()>>;
  /// Tasks that were still CREATED or RUNNING.
  fn load_active(&self) -> BoxFuture<'_, Result<Vec<Task>>>;
  fn save_model(&self, model: ModelMeta) -> BoxFuture<'_, Result<()>>;
  fn load_models(&self) -> BoxFuture<'_, Result<Vec<ModelMeta>>>;
}

#[derive(Debug, Clone)]
pub struct PgTaskStore {
  pool: Pool<Postgres>,
}

impl PgTaskStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

impl TaskStore for PgTaskStore {
  fn save_task(&self, task: Task) -> BoxFuture<'_, Result<()>> {
    async move {
      sqlx::query(
        "INSERT INTO ml_tasks (task_id, task_type, state, model_id, document, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (task_id) DO UPDATE
         SET state = EXCLUDED.state, document = EXCLUDED.document, updated_at = EXCLUDED.updated_at",
      )
        .bind(&task.task_id.0)
        .bind(task.task_type.to_string())
        .bind(task.state.as_str())
        .bind(task.model_id.as_deref())
        .bind(Json(&task))
        .bind(task.last_update_time)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving task {}", task.task_id))?;
      Ok(())
    }
    .boxed()
  }

  fn delete_task(&self, task_id: TaskId) -> BoxFuture<'_, Result<()>> {
    async move {
      sqlx::query("DELETE FROM ml_tasks WHERE task_id = $1")
        .bind(&task_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("deleting task {}", task_id))?;
      Ok(())
    }
    .boxed()
  }

  fn load_active(&self) -> BoxFuture<'_, Result<Vec<Task>>> {
    async move {
      let rows: Vec<(Json<Task>,)> = sqlx::query_as(
        "SELECT document FROM ml_tasks WHERE state IN ('CREATED', 'RUNNING') ORDER BY updated_at",
      )
        .fetch_all(&self.pool)
        .await
        .context("loading active tasks")?;
      Ok(rows.into_iter().map(|(Json(task),)| task).collect())
    }
    .boxed()
  }

  fn save_model(&self, model: ModelMeta) -> BoxFuture<'_, Result<()>> {
    async move {
      sqlx::query(
        "INSERT INTO ml_models (model_id, document, updated_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (model_id) DO UPDATE
         SET document = EXCLUDED.document, updated_at = EXCLUDED.updated_at",
      )
        .bind(&model.model_id)
        .bind(Json(&model))
        .bind(model.last_update_time)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving model {}", model.model_id))?;
      Ok(())
    }
    .boxed()
  }

  fn load_models(&self) -> BoxFuture<'_, Result<Vec<ModelMeta>>> {
    async move {
      let rows: Vec<(Json<ModelMeta>,)> = sqlx::query_as("SELECT document FROM ml_models")
        .fetch_all(&self.pool)
        .await
        .context("loading models")?;
      Ok(rows.into_iter().map(|(Json(model),)| model).collect())
    }
    .boxed()
  }
}

/// Store for single-process runs and tests.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
  tasks: DashMap<TaskId, Task>,
  models: DashMap<String, ModelMeta>,
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn task(&self, task_id: &TaskId) -> Option<Task> {
    self.tasks.get(task_id).map(|t| t.clone())
  }

  pub fn model(&self, model_id: &str) -> Option<ModelMeta> {
    self.models.get(model_id).map(|m| m.clone())
  }
}

impl TaskStore for MemoryTaskStore {
  fn save_task(&self, task: Task) -> BoxFuture<'_, Result<()>> {
    self.tasks.insert(task.task_id.clone(), task);
    async { Ok(()) }.boxed()
  }

  fn delete_task(&self, task_id: TaskId) -> BoxFuture<'_, Result<()>> {
    self.tasks.remove(&task_id);
    async { Ok(()) }.boxed()
  }

  fn load_active(&self) -> BoxFuture<'_, Result<Vec<Task>>> {
    let mut tasks: Vec<Task> = self
      .tasks
      .iter()
      .filter(|t| !t.state.is_terminal())
      .map(|t| t.clone())
      .collect();
    tasks.sort_by(|a, b| a.last_update_time.cmp(&b.last_update_time));
    async move { Ok(tasks) }.boxed()
  }

  fn save_model(&self, model: ModelMeta) -> BoxFuture<'_, Result<()>> {
    self.models.insert(model.model_id.clone(), model);
    async { Ok(()) }.boxed()
  }

  fn load_models(&self) -> BoxFuture<'_, Result<Vec<ModelMeta>>> {
    let models: Vec<ModelMeta> = self.models.iter().map(|m| m.clone()).collect();
    async move { Ok(models) }.boxed()
  }
}
