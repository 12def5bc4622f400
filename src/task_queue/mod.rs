//! TaskQ - bounded, single-consumer sequential task runner
//!
//! Producers `submit` and return immediately; a full queue is reported as
//! `Error::QueueFull` instead of blocking. One worker drains tasks strictly
//! in submission order, so two queued tasks never overlap even when each
//! fans out internally.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct Job {
    name: String,
    task: BoxFuture<'static, ()>,
}

/// Handle for submitting tasks
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Job>,
    capacity: usize,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TaskQueue {
    /// Creates the queue and spawns its worker. The worker exits once every
    /// handle is dropped and the queue is drained.
    pub fn new(capacity: usize) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_worker(rx));
        (Self { tx, capacity }, worker)
    }

    /// Enqueues a task without waiting for it to run
    pub fn submit<F>(&self, name: &str, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            name: name.to_string(),
            task: task.boxed(),
        };

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                tracing::warn!(task = %job.name, capacity = self.capacity, "Task queue full, task dropped");
                Error::QueueFull(job.name)
            }
            mpsc::error::TrySendError::Closed(job) => {
                Error::Internal(format!("task queue closed, dropped '{}'", job.name))
            }
        })
    }

    /// Waits until every task submitted before this call has finished
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            name: "flush".to_string(),
            task: async move {
                let _ = done_tx.send(());
            }
            .boxed(),
        };

        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Internal("task queue closed".into()))?;
        done_rx
            .await
            .map_err(|_| Error::Internal("task queue worker stopped".into()))
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        tracing::trace!(task = %job.name, "Task started");

        // a job that ends in a JoinError (cancelled, or panicked under an
        // unwinding build) is logged and the worker moves on; the shipped
        // profiles abort on panic
        if let Err(e) = tokio::spawn(job.task).await {
            tracing::error!(task = %job.name, error = %e, "Task failed");
        }

        tracing::trace!(task = %job.name, "Task finished");
    }

    tracing::debug!("Task queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_in_submission_order_without_overlap() {
        let (queue, _worker) = TaskQueue::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("a", 30u64), ("b", 1), ("c", 10)] {
            let log = log.clone();
            queue
                .submit(name, async move {
                    log.lock().unwrap().push(format!("start {}", name));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    log.lock().unwrap().push(format!("end {}", name));
                })
                .unwrap();
        }

        queue.flush().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "end a", "start b", "end b", "start c", "end c"]
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (queue, _worker) = TaskQueue::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // occupies the worker
        queue
            .submit("blocker", async move {
                let _ = release_rx.await;
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // fills the single slot
        queue.submit("queued", async {}).unwrap();
        let err = queue.submit("overflow", async {}).unwrap_err();
        assert!(matches!(err, Error::QueueFull(name) if name == "overflow"));

        let _ = release_tx.send(());
        queue.flush().await.unwrap();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_worker() {
        let (queue, _worker) = TaskQueue::new(4);
        queue.submit("bad", async { panic!("boom") }).unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        queue
            .submit("good", async move {
                *flag.lock().unwrap() = true;
            })
            .unwrap();

        queue.flush().await.unwrap();
        assert!(*ran.lock().unwrap());
    }
}
