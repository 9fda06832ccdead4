//! Batch schedulers - Poll for pending batches and run them on bounded workers.
//!
//! [`BatchScheduler`] lists pending batches of one process type every interval
//! and dispatches them through a semaphore. [`PriorityScheduler`] scores what it
//! discovers, feeds a bounded queue without ever blocking discovery, and lets a
//! fixed set of workers drain it.
//!
//! Shutdown is cooperative: the signal is checked between ticks and between
//! dispatches, and batches already running are awaited, never aborted.

use crate::{
    core::{
        batch::{self, BatchStatus},
        metrics::Metrics,
    },
    entities::batch_history,
    errors::{Error, Result},
};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{DatabaseConnection, prelude::DateTimeUtc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Size that costs a batch as much priority as one minute of waiting.
pub const SIZE_PENALTY_BYTES_PER_MINUTE: f64 = 1024.0 * 1024.0;

/// Work for one process type.
///
/// `process` runs on a batch already claimed as `processing`. It may set the
/// terminal status itself; if it returns `Ok` and leaves the batch processing,
/// the scheduler completes it, and if it returns `Err` the scheduler fails it.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Tag of the batches this processor handles
    fn process_type(&self) -> &'static str;

    /// Processes one batch
    async fn process(&self, batch: &batch_history::Model) -> Result<()>;
}

/// Runs a claimed batch to completion with panic and deadline isolation.
async fn execute_batch(
    db: DatabaseConnection,
    processor: Arc<dyn BatchProcessor>,
    batch: batch_history::Model,
    deadline: Option<Duration>,
    metrics: Arc<Metrics>,
) {
    let batch_id = batch.id;
    let handle = tokio::spawn(async move { processor.process(&batch).await });
    let abort = handle.abort_handle();

    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                Ok(Err(Error::Timeout {
                    operation: format!("batch {batch_id}"),
                }))
            }
        },
        None => handle.await,
    };

    let (status, message) = match outcome {
        Ok(Ok(())) => (BatchStatus::Completed, None),
        Ok(Err(e)) => {
            warn!(batch_id, error = %e, "Batch failed");
            (BatchStatus::Failed, Some(e.to_string()))
        }
        Err(join_error) => {
            error!(batch_id, error = %join_error, "Batch task panicked");
            (BatchStatus::Failed, Some(format!("batch task panicked: {join_error}")))
        }
    };

    match batch::update_status(&db, batch_id, status, message.as_deref()).await {
        Ok(()) => {
            if status == BatchStatus::Completed {
                metrics.add_batches_completed(1);
            } else {
                metrics.add_batches_failed(1);
            }
            debug!(batch_id, %status, "Batch finalised by scheduler");
        }
        // The processor already recorded a terminal status.
        Err(Error::InvalidStatusTransition { .. }) => {}
        Err(e) => error!(batch_id, error = %e, "Could not record batch status"),
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            error!(error = %e, "Batch worker ended abnormally");
        }
    }
}

/// Fixed-interval scheduler for one process type.
pub struct BatchScheduler {
    db: DatabaseConnection,
    processor: Arc<dyn BatchProcessor>,
    interval: Duration,
    gate: Arc<Semaphore>,
    batch_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl BatchScheduler {
    /// Creates a scheduler running at most `max_concurrent` batches at once
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        processor: Arc<dyn BatchProcessor>,
        interval: Duration,
        max_concurrent: usize,
        batch_timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            processor,
            interval,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
            batch_timeout,
            metrics,
        }
    }

    /// Lists pending batches and dispatches each one that can be claimed,
    /// waiting on the gate when all workers are busy. Returns how many were
    /// dispatched.
    pub async fn tick(&self, tasks: &mut JoinSet<()>, shutdown: &watch::Receiver<bool>) -> Result<usize> {
        reap(tasks);
        let pending = batch::list_pending_by_type(&self.db, self.processor.process_type()).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(process_type = self.processor.process_type(), pending = pending.len(), "Pending batches found");

        let mut dispatched = 0;
        for pending_batch in pending {
            if *shutdown.borrow() {
                break;
            }
            let permit = Arc::clone(&self.gate)
                .acquire_owned()
                .await
                .map_err(|_| Error::Config {
                    message: "scheduler gate closed".to_string(),
                })?;
            if !batch::claim_batch(&self.db, pending_batch.id).await? {
                continue;
            }

            let db = self.db.clone();
            let processor = Arc::clone(&self.processor);
            let metrics = Arc::clone(&self.metrics);
            let deadline = self.batch_timeout;
            info!(batch_id = pending_batch.id, process_type = %pending_batch.process_type, "Dispatching batch");
            tasks.spawn(async move {
                execute_batch(db, processor, pending_batch, deadline, metrics).await;
                drop(permit);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Polls until `shutdown` turns true, then waits for in-flight batches.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        info!(
            process_type = self.processor.process_type(),
            interval_secs = self.interval.as_secs(),
            "Batch scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&mut tasks, &shutdown).await {
                        error!(process_type = self.processor.process_type(), error = %e, "Scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Batch scheduler stopping, draining in-flight batches");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Batch worker ended abnormally");
            }
        }
        info!(process_type = self.processor.process_type(), "Batch scheduler stopped");
    }
}

/// Priority of a pending batch: seconds waited, minus a minute per MiB of file.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn priority_score(batch: &batch_history::Model, now: DateTimeUtc) -> f64 {
    let age = (now - batch.created_at).num_milliseconds() as f64 / 1000.0;
    let size = batch.file_size.unwrap_or(0).max(0) as f64;
    age - size / SIZE_PENALTY_BYTES_PER_MINUTE * 60.0
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Batches put on the queue
    pub enqueued: usize,
    /// Batches left for the next poll because the queue was full
    pub dropped: usize,
}

/// Scheduler feeding a bounded, priority-ordered queue drained by workers.
pub struct PriorityScheduler {
    db: DatabaseConnection,
    processor: Arc<dyn BatchProcessor>,
    interval: Duration,
    workers: usize,
    queue_capacity: usize,
    batch_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
    queued: Arc<Mutex<HashSet<i64>>>,
}

impl PriorityScheduler {
    /// Creates a scheduler with `workers` workers and a queue of `queue_capacity`
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        processor: Arc<dyn BatchProcessor>,
        interval: Duration,
        workers: usize,
        queue_capacity: usize,
        batch_timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            processor,
            interval,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
            batch_timeout,
            metrics,
            queued: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Scores pending batches and offers them to the queue, highest priority
    /// first, without waiting. Batches already queued are not offered again.
    pub async fn discover(&self, queue: &mpsc::Sender<batch_history::Model>) -> Result<Discovery> {
        let pending = batch::list_pending_by_type(&self.db, self.processor.process_type()).await?;
        let now = Utc::now();
        let mut scored: Vec<(f64, batch_history::Model)> = pending
            .into_iter()
            .map(|b| (priority_score(&b, now), b))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut result = Discovery::default();
        let mut queued = self.queued.lock().await;
        let fresh: Vec<(f64, batch_history::Model)> = scored
            .into_iter()
            .filter(|(_, b)| !queued.contains(&b.id))
            .collect();
        let offered = fresh.len();

        for (index, (score, candidate)) in fresh.into_iter().enumerate() {
            let id = candidate.id;
            match queue.try_send(candidate) {
                Ok(()) => {
                    queued.insert(id);
                    result.enqueued += 1;
                    debug!(batch_id = id, score, "Batch queued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    result.dropped = offered - index;
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        drop(queued);

        if result.dropped > 0 {
            warn!(dropped = result.dropped, "Job queue full, retrying next poll");
        }
        Ok(result)
    }

    /// Runs discovery and workers until `shutdown` turns true, then waits for
    /// running batches. Queued batches that never started stay pending.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel::<batch_history::Model>(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        for worker_id in 0..self.workers {
            let rx = Arc::clone(&rx);
            let db = self.db.clone();
            let processor = Arc::clone(&self.processor);
            let metrics = Arc::clone(&self.metrics);
            let queued = Arc::clone(&self.queued);
            let deadline = self.batch_timeout;
            let stop = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    let id = job.id;
                    if !*stop.borrow() {
                        match batch::claim_batch(&db, id).await {
                            Ok(true) => {
                                debug!(worker_id, batch_id = id, "Worker picked batch");
                                execute_batch(
                                    db.clone(),
                                    Arc::clone(&processor),
                                    job,
                                    deadline,
                                    Arc::clone(&metrics),
                                )
                                .await;
                            }
                            Ok(false) => debug!(batch_id = id, "Batch claimed elsewhere"),
                            Err(e) => error!(batch_id = id, error = %e, "Could not claim batch"),
                        }
                    }
                    queued.lock().await.remove(&id);
                }
                debug!(worker_id, "Worker stopped");
            });
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            process_type = self.processor.process_type(),
            workers = self.workers,
            queue_capacity = self.queue_capacity,
            "Priority scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.discover(&tx).await {
                        error!(error = %e, "Discovery failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker ended abnormally");
            }
        }
        info!(process_type = self.processor.process_type(), "Priority scheduler stopped");
    }
}
