//! Background evaluation workers.
//!
//! The dispatch endpoint hands job ids to a [`TaskEnqueuer`] and returns
//! immediately. A [`WorkerPool`] drains the queue, evaluates each job and
//! writes the terminal status the long-poll loop is waiting to observe.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::EnqueueError;
use crate::evaluator::EvaluationService;
use crate::models::JobStatus;
use crate::store::JobStore;

/// Fire-and-forget job trigger.
pub trait TaskEnqueuer: Send + Sync {
    fn enqueue(&self, job_id: &str) -> Result<(), EnqueueError>;
}

/// Fixed-size group of tokio tasks sharing one job queue.
#[derive(Debug)]
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    joins: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers (at least one).
    pub fn spawn(
        store: Arc<dyn JobStore>,
        evaluator: EvaluationService,
        concurrency: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let evaluator = Arc::new(evaluator);

        let concurrency = concurrency.max(1);
        let mut joins = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let store = Arc::clone(&store);
            let evaluator = Arc::clone(&evaluator);
            let receiver = Arc::clone(&receiver);
            let mut shutdown_rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, store, evaluator, receiver, &mut shutdown_rx).await;
            }));
        }
        tracing::info!("Started {} evaluation workers", concurrency);

        Self {
            sender,
            shutdown_tx,
            joins: parking_lot::Mutex::new(joins),
        }
    }

    /// Workers still running.
    pub fn worker_count(&self) -> usize {
        self.joins.lock().len()
    }

    /// Stop taking new jobs and wait for in-flight ones to finish.
    ///
    /// Jobs still queued are dropped. Later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let joins = std::mem::take(&mut *self.joins.lock());
        for join in joins {
            if let Err(e) = join.await {
                tracing::error!("Evaluation worker exited abnormally: {}", e);
            }
        }
        tracing::info!("Evaluation workers stopped");
    }
}

impl TaskEnqueuer for WorkerPool {
    fn enqueue(&self, job_id: &str) -> Result<(), EnqueueError> {
        self.sender
            .send(job_id.to_string())
            .map_err(|_| EnqueueError::Closed)?;
        tracing::debug!("Enqueued evaluation job {}", job_id);
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn JobStore>,
    evaluator: Arc<EvaluationService>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = async { receiver.lock().await.recv().await } => next,
        };
        let Some(job_id) = next else {
            break;
        };

        tracing::debug!("Worker {} picked up job {}", worker_id, job_id);
        process_evaluation_job(store.as_ref(), &evaluator, &job_id).await;
    }
    tracing::debug!("Worker {} stopped", worker_id);
}

/// Evaluate one job and persist its terminal status.
///
/// Returns the status written, or `None` when the job does not exist or a
/// store write failed. Never panics and never retries.
pub async fn process_evaluation_job(
    store: &dyn JobStore,
    evaluator: &EvaluationService,
    job_id: &str,
) -> Option<JobStatus> {
    let job = match store.read(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!("Evaluation job {} not found; skipping", job_id);
            return None;
        }
        Err(e) => {
            tracing::error!("Failed to load evaluation job {}: {}", job_id, e);
            return None;
        }
    };

    if let Err(e) = store.mark_in_progress(job_id).await {
        tracing::error!("Failed to mark job {} in progress: {}", job_id, e);
        return None;
    }

    let outcome = match store.load_criteria(&job.evaluation_id).await {
        Ok(Some(criteria)) => evaluator
            .evaluate_job(&job, &criteria)
            .await
            .map_err(|e| e.to_string()),
        Ok(None) => Err(format!("Evaluation criteria {} not found", job.evaluation_id)),
        Err(e) => Err(e.to_string()),
    };

    let written = match outcome {
        Ok(results) => store
            .mark_completed(job_id, results)
            .await
            .map(|_| JobStatus::Completed),
        Err(message) => {
            tracing::error!("Evaluation job {} failed: {}", job_id, message);
            store
                .mark_failed(job_id, &message)
                .await
                .map(|_| JobStatus::Failed)
        }
    };

    match written {
        Ok(status) => {
            tracing::info!("Evaluation job {} finished: {}", job_id, status);
            Some(status)
        }
        Err(e) => {
            tracing::error!("Failed to record result for job {}: {}", job_id, e);
            None
        }
    }
}
