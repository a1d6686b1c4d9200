//! Fixed pool of copier workers writing batches into the sample store.
//!
//! Workers share one bounded queue. Submitting blocks while the queue is
//! full, which is the only backpressure the write path applies. A batch is
//! dispatched once a worker picks it up; queued batches of a cancelled
//! request are skipped, dispatched ones run to completion.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    router::{Batch, PartitionKey},
    storage::SampleStore,
};

/// What happened to one submitted batch.
#[derive(Debug)]
pub struct CopyOutcome {
    pub key: PartitionKey,
    /// Rows the batch carried.
    pub rows: usize,
    /// Rows the store reported as written.
    pub result: Result<u64>,
}

struct CopyJob {
    batch: Batch,
    cancel: CancellationToken,
    reply: oneshot::Sender<CopyOutcome>,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<CopyJob>>>;

pub struct CopierPool {
    sender: RwLock<Option<mpsc::Sender<CopyJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl std::fmt::Debug for CopierPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopierPool")
            .field("size", &self.size)
            .field("running", &self.sender.read().is_some())
            .finish()
    }
}

impl CopierPool {
    /// Spawns `workers` copiers on the current tokio runtime.
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        store: Arc<dyn SampleStore>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    queue.clone(),
                    store.clone(),
                    retry.clone(),
                    call_timeout,
                ))
            })
            .collect();
        tracing::debug!(workers, queue_capacity, "copier pool started");
        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            size: workers,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `batch`, waiting for room if the queue is full. The returned
    /// receiver yields the outcome once a worker is done with it.
    pub async fn submit(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<oneshot::Receiver<CopyOutcome>> {
        let sender = self.sender.read().clone().ok_or(Error::Shutdown)?;
        let (reply, outcome) = oneshot::channel();
        let job = CopyJob {
            batch,
            cancel: cancel.clone(),
            reply,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = sender.send(job) => sent.map(|()| outcome).map_err(|_| Error::Shutdown),
        }
    }

    /// Stops accepting batches and waits until the workers have drained the
    /// queue.
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "copier worker panicked");
            }
        }
        tracing::debug!("copier pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    queue: JobQueue,
    store: Arc<dyn SampleStore>,
    retry: RetryPolicy,
    call_timeout: Duration,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(CopyJob {
            batch,
            cancel,
            reply,
        }) = job
        else {
            break;
        };

        let result = if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            let store = &*store;
            let batch = &batch;
            retry
                .run("insert_batch", call_timeout, || store.insert_batch(batch))
                .await
        };
        match &result {
            Ok(rows) => tracing::debug!(worker = id, partition = %batch.key, rows, "batch written"),
            Err(Error::Cancelled) => {
                tracing::debug!(worker = id, partition = %batch.key, "skipping cancelled batch")
            }
            Err(e) => {
                tracing::warn!(worker = id, partition = %batch.key, error = %e, "batch failed")
            }
        }
        // The submitter may have gone away; the rows are written regardless.
        let _ = reply.send(CopyOutcome {
            rows: batch.len(),
            key: batch.key,
            result,
        });
    }
    tracing::debug!(worker = id, "copier worker exiting");
}
