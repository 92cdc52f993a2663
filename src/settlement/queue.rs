// Settlement Queue - strict FIFO, one task at a time
//
// Every reserve mutation and every ledger write runs as a queue task, so the
// worker loop is the mutual-exclusion boundary around ReserveState.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{AppError, AppResult};

type Job = BoxFuture<'static, ()>;

pub struct SettlementQueue {
    sender: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

/// Resolves with the task's output once it has run to completion
pub struct QueueHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> QueueHandle<T> {
    pub async fn wait(self) -> AppResult<T> {
        self.receiver
            .await
            .map_err(|_| AppError::Internal("settlement task aborted before completing".to_string()))
    }
}

impl SettlementQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = depth.clone();

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                // A panicking task must not take the worker down with it
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("❌ Settlement task panicked");
                }
                worker_depth.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Settlement queue drained and closed");
        });

        Self {
            sender,
            depth,
            worker,
        }
    }

    /// Admit a task behind everything already queued.
    ///
    /// Dropping the returned handle does not cancel the task.
    pub fn enqueue<F, T>(&self, task: F) -> AppResult<QueueHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, receiver) = oneshot::channel();

        let job: Job = Box::pin(async move {
            let output = task.await;
            let _ = tx.send(output);
        });

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Internal("settlement queue is closed".to_string()));
        }

        Ok(QueueHandle { receiver })
    }

    /// Tasks queued or running
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stop admitting tasks and wait for queued ones to finish
    pub async fn shutdown(self) {
        let SettlementQueue { sender, worker, .. } = self;
        drop(sender);
        if let Err(e) = worker.await {
            error!("Settlement queue worker failed: {:?}", e);
        }
    }
}
