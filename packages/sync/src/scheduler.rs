//! Bounded worker pool with a single completion channel.
//!
//! The semaphore bounds how many parts are read and sent at once. The
//! completion channel is unbounded so a finished worker never waits on the
//! collector while it still holds a slot.

use std::sync::Arc;

use supersync_sync_models::PartResult;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::error::SyncError;
use crate::progress::ProgressCallback;
use crate::worker::PartWorker;

type Completion = Result<PartResult, SyncError>;

/// Runs one task per part, at most `concurrency` at a time, and gathers
/// their results.
pub struct PartScheduler {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    sender: mpsc::UnboundedSender<Completion>,
    receiver: mpsc::UnboundedReceiver<Completion>,
    dispatched: u32,
}

impl PartScheduler {
    /// Creates a scheduler running up to `concurrency` parts in parallel.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            tasks: JoinSet::new(),
            sender,
            receiver,
            dispatched: 0,
        }
    }

    /// Spawns a task processing `part_number` once a slot is free.
    pub fn dispatch(&mut self, worker: &Arc<PartWorker>, part_number: u32) {
        let worker = Arc::clone(worker);
        let semaphore = Arc::clone(&self.semaphore);
        let sender = self.sender.clone();

        self.tasks.spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                return;
            };
            let result = worker.process(part_number).await;
            drop(permit);
            // The receiver is gone only when collection already gave up.
            let _ = sender.send(result);
        });
        self.dispatched += 1;
    }

    /// Waits for every dispatched part.
    ///
    /// Results arrive in completion order. On the first failure every
    /// in-flight task is cancelled and that failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first worker error, or [`SyncError::Worker`] if a task
    /// ended without reporting a result.
    pub async fn collect(self, progress: &dyn ProgressCallback) -> Result<Vec<PartResult>, SyncError> {
        let Self {
            semaphore: _,
            mut tasks,
            sender,
            mut receiver,
            dispatched,
        } = self;
        // Only task-held senders remain, so the channel closes once every
        // task has finished.
        drop(sender);

        let mut results = Vec::with_capacity(dispatched as usize);
        while results.len() < dispatched as usize {
            match receiver.recv().await {
                Some(Ok(result)) => {
                    log::trace!("Part {} finished", result.part_number);
                    progress.inc(1);
                    results.push(result);
                }
                Some(Err(e)) => {
                    log::error!("{e}; cancelling {} in-flight part(s)", tasks.len());
                    tasks.abort_all();
                    return Err(e);
                }
                None => {
                    return Err(lost_task_error(&mut tasks, results.len(), dispatched).await);
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(results)
    }
}

async fn lost_task_error(tasks: &mut JoinSet<()>, received: usize, dispatched: u32) -> SyncError {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            return SyncError::Worker {
                message: e.to_string(),
            };
        }
    }
    SyncError::Worker {
        message: format!("only {received} of {dispatched} part(s) reported a result"),
    }
}

/// Sorts `results` by part number and checks they are exactly
/// `1..=part_count`.
///
/// # Errors
///
/// Returns [`SyncError::Protocol`] on a missing, duplicate, or
/// out-of-range part.
pub fn order_results(
    mut results: Vec<PartResult>,
    part_count: u32,
) -> Result<Vec<PartResult>, SyncError> {
    results.sort_by_key(|r| r.part_number);

    for (expected, result) in (1..=part_count).zip(&results) {
        if result.part_number != expected {
            let message = if result.part_number < expected {
                format!("part {} was reported more than once", result.part_number)
            } else {
                format!("part {expected} is missing")
            };
            return Err(SyncError::Protocol { message });
        }
    }

    if results.len() != part_count as usize {
        return Err(SyncError::Protocol {
            message: format!(
                "expected {part_count} part result(s), received {}",
                results.len()
            ),
        });
    }

    Ok(results)
}
