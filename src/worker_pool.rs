//! Bounded per-node job pool: a fixed number of worker loops pulling from a
//! bounded queue. A full queue turns the job away instead of growing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::NodeError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone)]
pub struct WorkerPool {
  tx: mpsc::Sender<Job>,
  size: usize,
}

impl WorkerPool {
  /// Must be called from inside a tokio runtime.
  pub fn new(size: usize, capacity: usize) -> Self {
    let size = size.max(1);
    let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for worker_id in 0..size {
      let rx = rx.clone();
      tokio::spawn(async move {
        tracing::debug!("Pool worker {} started", worker_id);
        loop {
          let job = rx.lock().await.recv().await;
          match job {
            Some(job) => job.await,
            None => break,
          }
        }
        tracing::debug!("Pool worker {} stopped", worker_id);
      });
    }
    Self { tx, size }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Fire and forget.
  pub fn submit<F>(&self, job: F) -> Result<(), NodeError>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tx.try_send(Box::pin(job)).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => NodeError::Rejected { message: "worker queue is full".into() },
      mpsc::error::TrySendError::Closed(_) => NodeError::Rejected { message: "worker pool is shut down".into() },
    })
  }

  /// Queues `job` and waits for its result.
  pub async fn run<F, T>(&self, job: F) -> Result<T, NodeError>
  where
    F: Future<Output = Result<T, NodeError>> + Send + 'static,
    T: Send + 'static,
  {
    let (done_tx, done_rx) = oneshot::channel();
    self.submit(async move {
      let _ = done_tx.send(job.await);
    })?;
    done_rx
      .await
      .map_err(|_| NodeError::handler("pool job dropped before finishing"))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn run_returns_job_result() {
    let pool = WorkerPool::new(2, 4);
    let value = pool.run(async { Ok::<_, NodeError>(41 + 1) }).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(pool.size(), 2);
  }

  #[tokio::test]
  async fn full_queue_rejects() {
    let pool = WorkerPool::new(1, 1);
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    pool
      .submit(async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
      })
      .unwrap();
    started_rx.await.unwrap();

    pool.submit(async {}).unwrap();
    let err = pool.submit(async {}).unwrap_err();
    assert!(matches!(err, NodeError::Rejected { .. }));

    release_tx.send(()).unwrap();
  }
}
