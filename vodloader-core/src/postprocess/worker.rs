use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Classify;
use crate::queue::{PostProcessQueue, QueueEntry};
use crate::store::{CaptureStore, PartFilter};

use super::{PostProcessError, PostProcessResult, PostProcessor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows put back in line by [`crate::queue::QueueStore::recover`].
    pub requeued: usize,
    /// Ended parts without output that had no live queue row.
    pub enqueued: usize,
}

/// Startup pass: requeue interrupted work, then queue every ended part that
/// still lacks an output.
pub fn recover_pending(
    store: &dyn CaptureStore,
    queue: &PostProcessQueue,
) -> PostProcessResult<RecoveryReport> {
    let requeued = queue.store().recover()?;
    let mut enqueued = 0;
    for part in store.list_parts(&PartFilter::pending_post_process())? {
        if queue.enqueue_part(&part)?.is_new_work() {
            enqueued += 1;
        }
    }
    info!(requeued, enqueued, "post-process queue recovered");
    Ok(RecoveryReport { requeued, enqueued })
}

/// The pool of queue drain loops.
#[derive(Debug)]
pub struct PostProcessWorkers {
    queue: PostProcessQueue,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PostProcessWorkers {
    pub fn spawn(processor: Arc<PostProcessor>, workers: usize, poll_interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let tasks = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&processor),
                    poll_interval,
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            queue: processor.queue().clone(),
            cancel,
            tasks,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancels in-flight jobs (their rows stay `processing` and are
    /// requeued on the next start) and waits for every loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.queue.wake_all();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "post-process worker ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    processor: Arc<PostProcessor>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    info!(worker, "post-process worker started");
    while !cancel.is_cancelled() {
        match processor.queue().claim_next() {
            Ok(Some(entry)) => run_isolated(worker, &processor, entry, &cancel).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = processor.queue().wait_for_work(poll_interval) => {}
                }
            }
            Err(err) => {
                error!(worker, error = %err, "failed to claim post-process work");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    info!(worker, "post-process worker stopped");
}

/// Runs one job on its own task so that a panic fails the entry instead of
/// the worker.
async fn run_isolated(
    worker: usize,
    processor: &Arc<PostProcessor>,
    entry: QueueEntry,
    cancel: &CancellationToken,
) {
    let id = entry.id;
    info!(worker, entry = id, part_id = %entry.part_id, attempts = entry.attempts, "claimed part");
    let job = {
        let processor = Arc::clone(processor);
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.handle(&entry, &cancel).await })
    };
    if let Err(err) = job.await {
        let err = PostProcessError::Task(err.to_string());
        error!(worker, entry = id, class = %err.class(), error = %err, "post-process job crashed");
        if let Err(mark_err) = processor
            .queue()
            .store()
            .mark_failed(id, &err.to_string(), false)
        {
            warn!(entry = id, error = %mark_err, "failed to mark crashed entry");
        }
    }
}
