// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery workers.
//!
//! ```text
//!   dispatch queue ──▶ worker ──▶ Router ──▶ Deliverer ──▶ backend
//!         ▲              │
//!         │              ├── success ─────────────▶ Ledger::delivered
//!         │              ├── fatal ───────────────▶ Ledger::dead_letter(fatal)
//!         │              └── retryable ─┬─ budget left ─▶ sleep(backoff) ──┐
//!         │                             └─ exhausted ───▶ dead_letter      │
//!         └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each attempt runs under a timeout and inside `catch_unwind`, so a hung backend or a panic
//! while delivering turns into a retryable failure instead of taking the worker down. Pending
//! retries are tracked tasks; cancelling the hard stop token dead-letters them.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::batch::RecordBatch;
use crate::egress::{Deliverer, DeliveryAttemptResult, DeliveryOutcome};
use crate::errors::{DequeueError, EnqueueError, RouteError};
use crate::health::{HealthEvent, HealthTracker};
use crate::ledger::{DropReason, Ledger};
use crate::metrics;
use crate::queue::{BoundedQueue, Enqueued};
use crate::retry::RetryPolicy;
use crate::router::Router;

/// How long an idle worker waits on the dispatch queue before checking for a stop request.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

pub struct DeliveryWorkerPool {
    config: WorkerPoolConfig,
    dispatch: Arc<BoundedQueue>,
    router: Arc<Router>,
    tracker: Arc<HealthTracker>,
    deliverer: Arc<dyn Deliverer>,
    ledger: Arc<Ledger>,
    retries: TaskTracker,
    hard_stop: CancellationToken,
}

impl DeliveryWorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        dispatch: Arc<BoundedQueue>,
        router: Arc<Router>,
        tracker: Arc<HealthTracker>,
        deliverer: Arc<dyn Deliverer>,
        ledger: Arc<Ledger>,
        hard_stop: CancellationToken,
    ) -> Self {
        DeliveryWorkerPool {
            config,
            dispatch,
            router,
            tracker,
            deliverer,
            ledger,
            retries: TaskTracker::new(),
            hard_stop,
        }
    }

    /// Spawns the workers. They run until the dispatch queue is closed and empty, or the hard
    /// stop token is cancelled.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker_id| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run_worker(worker_id).await })
            })
            .collect()
    }

    /// Number of batches sleeping before their next attempt.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Waits for every pending retry task to finish. Call after cancelling the hard stop token.
    pub async fn wait_retries(&self) {
        self.retries.close();
        self.retries.wait().await;
    }

    async fn run_worker(&self, worker_id: usize) {
        debug!("Delivery worker {worker_id} started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.hard_stop.cancelled() => break,
                next = self.dispatch.dequeue(Some(IDLE_POLL)) => next,
            };
            match next {
                Ok(batch) => self.process(batch).await,
                Err(DequeueError::Empty) => continue,
                Err(DequeueError::Closed) => break,
            }
        }
        debug!("Delivery worker {worker_id} stopped");
    }

    /// Runs one delivery attempt for `batch` and settles its fate.
    pub async fn process(&self, mut batch: RecordBatch) {
        let backend = match self.router.route(&batch, Instant::now()) {
            Ok(backend) => backend,
            Err(RouteError::NoHealthyBackend) => {
                batch.record_attempt(None);
                warn!(
                    "No healthy backend for batch {} (attempt {})",
                    batch.id(),
                    batch.attempt()
                );
                self.retry_or_dead_letter(batch, None, DropReason::NoHealthyBackend);
                return;
            }
        };

        let started = Instant::now();
        let attempt = AssertUnwindSafe(tokio::time::timeout(
            self.config.attempt_timeout,
            self.deliverer.deliver(&backend, &batch),
        ))
        .catch_unwind();

        let outcome = tokio::select! {
            result = attempt => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_elapsed)) => DeliveryOutcome::retryable(format!(
                    "attempt timed out after {} ms",
                    self.config.attempt_timeout.as_millis()
                )),
                Err(_panic) => {
                    error!("Delivery of batch {} to {} panicked", batch.id(), backend.id);
                    DeliveryOutcome::retryable("delivery attempt panicked")
                }
            },
            _ = self.hard_stop.cancelled() => {
                self.ledger.dead_letter(batch, DropReason::Shutdown);
                return;
            }
        };

        batch.record_attempt(Some(backend.id.clone()));
        let result = DeliveryAttemptResult {
            batch_id: batch.id(),
            backend_id: backend.id.clone(),
            outcome,
            latency: started.elapsed(),
        };
        self.settle(batch, result);
    }

    fn settle(&self, batch: RecordBatch, result: DeliveryAttemptResult) {
        let event = if result.outcome.is_success() {
            HealthEvent::Success
        } else {
            HealthEvent::Failure
        };
        self.tracker.report(&result.backend_id, event, Instant::now());
        metrics::report_delivery(
            result.backend_id.as_str(),
            result.outcome.as_str(),
            result.latency,
        );

        match result.outcome {
            DeliveryOutcome::Success => {
                debug!(
                    "Batch {} delivered to {} in {} ms (attempt {})",
                    result.batch_id,
                    result.backend_id,
                    result.latency.as_millis(),
                    batch.attempt()
                );
                self.ledger.delivered(batch);
            }
            DeliveryOutcome::FatalFailure { detail } => {
                error!(
                    "Batch {} rejected by {}: {detail}",
                    result.batch_id, result.backend_id
                );
                self.ledger.dead_letter(batch, DropReason::Fatal);
            }
            DeliveryOutcome::RetryableFailure {
                detail,
                retry_after,
            } => {
                warn!(
                    "Batch {} failed on {} (attempt {}): {detail}",
                    result.batch_id,
                    result.backend_id,
                    batch.attempt()
                );
                self.retry_or_dead_letter(batch, retry_after, DropReason::Exhausted);
            }
        }
    }

    fn retry_or_dead_letter(
        &self,
        batch: RecordBatch,
        retry_after: Option<Duration>,
        exhausted_reason: DropReason,
    ) {
        if self.config.retry.exhausted(batch.attempt()) {
            self.ledger.dead_letter(batch, exhausted_reason);
            return;
        }
        if self.hard_stop.is_cancelled() {
            self.ledger.dead_letter(batch, DropReason::Shutdown);
            return;
        }

        let delay = self.config.retry.delay_with_jitter(
            batch.attempt(),
            retry_after,
            &mut rand::thread_rng(),
        );
        debug!(
            "Retrying batch {} in {} ms",
            batch.id(),
            delay.as_millis()
        );

        let dispatch = self.dispatch.clone();
        let ledger = self.ledger.clone();
        let hard_stop = self.hard_stop.clone();
        self.retries.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => match dispatch.enqueue(batch).await {
                    Ok(Enqueued::Accepted) => {}
                    Ok(Enqueued::Evicted(evicted)) => ledger.dead_letter(evicted, DropReason::Shed),
                    Err(EnqueueError::Full(batch)) => {
                        ledger.dead_letter(batch, DropReason::QueueFull)
                    }
                    Err(EnqueueError::Closed(batch)) => {
                        ledger.dead_letter(batch, DropReason::Shutdown)
                    }
                },
                _ = hard_stop.cancelled() => ledger.dead_letter(batch, DropReason::Shutdown),
            }
        });
    }
}
