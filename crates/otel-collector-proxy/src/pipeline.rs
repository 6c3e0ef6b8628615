// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires admission, the two queues, the batcher and the delivery workers together.
//!
//! ```text
//!   ingest ──▶ AdmissionController ──▶ ingress queue ──▶ BatcherService ──▶ dispatch queue
//!                                                                              │
//!                                                  Ledger ◀── DeliveryWorkerPool
//! ```

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, CallerClearance, IngressRequest};
use crate::batch::{BatchId, IdGenerator};
use crate::batcher::{Batcher, BatcherService};
use crate::config::Config;
use crate::egress::Deliverer;
use crate::errors::{AdmissionError, ConfigError, EnqueueError, IngestError};
use crate::health::{BackendStatus, HealthTracker};
use crate::ledger::{DropReason, Ledger, LedgerSnapshot};
use crate::merge::MergeRegistry;
use crate::metrics;
use crate::queue::{BoundedQueue, Enqueued};
use crate::router::Router;
use crate::worker_pool::DeliveryWorkerPool;

const INGRESS_QUEUE: &str = "ingress";
const DISPATCH_QUEUE: &str = "dispatch";

/// Outcome of [`Pipeline::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every admitted batch was resolved before the grace period ended.
    pub clean: bool,
    pub snapshot: LedgerSnapshot,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(value.as_millis())
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub name: &'static str,
    pub depth: usize,
    pub capacity: usize,
}

pub struct Pipeline {
    admission: AdmissionController,
    ingress: Arc<BoundedQueue>,
    dispatch: Arc<BoundedQueue>,
    tracker: Arc<HealthTracker>,
    ledger: Arc<Ledger>,
    workers: Arc<DeliveryWorkerPool>,
    tasks: Mutex<Tasks>,
    hard_stop: CancellationToken,
    shutdown_grace: Duration,
}

#[derive(Default)]
struct Tasks {
    batcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Builds every component and spawns the batcher and the workers. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: &Config, deliverer: Arc<dyn Deliverer>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let ids = Arc::new(IdGenerator::default());
        let admission = AdmissionController::new(config.admission.clone(), ids.clone())?;
        let ingress = Arc::new(BoundedQueue::new(
            INGRESS_QUEUE,
            config.ingress_queue.capacity,
            config.ingress_queue.policy,
        ));
        let dispatch = Arc::new(BoundedQueue::new(
            DISPATCH_QUEUE,
            config.dispatch_queue.capacity,
            config.dispatch_queue.policy,
        ));
        let ledger = Arc::new(Ledger::default());
        let tracker = Arc::new(HealthTracker::new(&config.backends, config.health.clone()));
        let router = Arc::new(Router::new(config.routing, tracker.clone()));
        let hard_stop = CancellationToken::new();

        let batcher = BatcherService::new(
            Batcher::new(config.batcher.clone(), MergeRegistry::default(), ids),
            ingress.clone(),
            dispatch.clone(),
            ledger.clone(),
        );
        let workers = Arc::new(DeliveryWorkerPool::new(
            config.delivery.clone(),
            dispatch.clone(),
            router,
            tracker.clone(),
            deliverer,
            ledger.clone(),
            hard_stop.clone(),
        ));

        let tasks = Tasks {
            batcher: Some(tokio::spawn(batcher.run())),
            workers: workers.spawn(),
        };
        info!(
            "Pipeline started with {} workers and {} backends ({:?} routing)",
            config.delivery.workers,
            config.backends.len(),
            config.routing
        );

        Ok(Arc::new(Pipeline {
            admission,
            ingress,
            dispatch,
            tracker,
            ledger,
            workers,
            tasks: Mutex::new(tasks),
            hard_stop,
            shutdown_grace: config.shutdown_grace,
        }))
    }

    /// Admits a request and hands the resulting batch to the ingress queue. Returns once the
    /// batch is queued; delivery happens later.
    pub async fn ingest(&self, request: IngressRequest) -> Result<BatchId, IngestError> {
        let clearance = self.clear_caller(request.caller.as_deref())?;
        self.ingest_cleared(clearance, request).await
    }

    /// Shutdown and rate limit checks for a caller, run before its payload is read.
    pub fn clear_caller(&self, caller: Option<&str>) -> Result<CallerClearance, IngestError> {
        Ok(self.admission.clear_caller(caller)?)
    }

    /// Second half of [`Pipeline::ingest`], for a caller already cleared.
    pub async fn ingest_cleared(
        &self,
        clearance: CallerClearance,
        request: IngressRequest,
    ) -> Result<BatchId, IngestError> {
        let batch = self.admission.admit_cleared(clearance, request)?;
        let id = batch.id();
        self.ledger.admitted(&batch);

        match self.ingress.enqueue(batch).await {
            Ok(Enqueued::Accepted) => Ok(id),
            Ok(Enqueued::Evicted(evicted)) => {
                self.ledger.dead_letter(evicted, DropReason::Shed);
                Ok(id)
            }
            Err(EnqueueError::Full(batch)) => {
                self.ledger.withdraw(&batch);
                metrics::report_rejected("queue_full");
                warn!("Ingress queue is full, rejecting batch {}", batch.id());
                Err(IngestError::QueueFull)
            }
            Err(EnqueueError::Closed(batch)) => {
                self.ledger.withdraw(&batch);
                metrics::report_rejected(AdmissionError::ShuttingDown.reason());
                Err(AdmissionError::ShuttingDown.into())
            }
        }
    }

    pub fn max_batch_bytes(&self) -> usize {
        self.admission.max_batch_bytes()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.admission.is_closed()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn backend_statuses(&self) -> Vec<BackendStatus> {
        self.tracker.statuses()
    }

    pub fn queue_statuses(&self) -> [QueueStatus; 2] {
        [&self.ingress, &self.dispatch].map(|queue| QueueStatus {
            name: queue.name(),
            depth: queue.len(),
            capacity: queue.capacity(),
        })
    }

    #[allow(clippy::expect_used)]
    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().expect("lock poisoned")
    }

    /// Stops admission and drains the pipeline within the configured grace period.
    ///
    /// Batches still outstanding when the grace period ends are dead-lettered with reason
    /// `shutdown`, so the ledger always balances once this returns. Calling it twice is
    /// harmless; the second call finds nothing left to do.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_by(Instant::now() + self.shutdown_grace).await
    }

    /// Like [`Pipeline::shutdown`], with a deadline the caller already fixed, typically when
    /// the shutdown signal arrived.
    pub async fn shutdown_by(&self, deadline: Instant) -> ShutdownReport {
        let started = Instant::now();
        info!(
            "Shutting down pipeline, {} batches outstanding, {} ms left",
            self.ledger.outstanding(),
            deadline.saturating_duration_since(started).as_millis()
        );

        self.admission.close();
        self.ingress.close();

        let drained = self.ledger.wait_drained(deadline).await;
        if !drained {
            warn!(
                "Grace period elapsed with {} batches outstanding, dead-lettering the rest",
                self.ledger.outstanding()
            );
        }

        // Workers exit once dispatch is closed and empty; the token cuts off in-flight
        // attempts and sleeping retries.
        self.hard_stop.cancel();
        self.dispatch.close();

        let (batcher, workers) = {
            let mut tasks = self.tasks();
            (tasks.batcher.take(), std::mem::take(&mut tasks.workers))
        };
        if let Some(batcher) = batcher {
            if let Err(e) = batcher.await {
                error!("Batcher task failed: {e}");
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Delivery worker failed: {e}");
            }
        }
        self.workers.wait_retries().await;

        for batch in self.ingress.drain().into_iter().chain(self.dispatch.drain()) {
            self.ledger.dead_letter(batch, DropReason::Shutdown);
        }

        let snapshot = self.ledger.snapshot();
        let report = ShutdownReport {
            clean: drained && snapshot.outstanding_batches == 0,
            snapshot,
            elapsed: started.elapsed(),
        };
        if report.clean {
            info!(
                "Pipeline drained in {} ms: {} delivered, {} dead-lettered, {} shed",
                report.elapsed.as_millis(),
                snapshot.delivered_batches,
                snapshot.dead_lettered_batches,
                snapshot.shed_batches
            );
        } else {
            warn!(
                "Pipeline stopped after {} ms without a clean drain: {} delivered, {} dead-lettered",
                report.elapsed.as_millis(),
                snapshot.delivered_batches,
                snapshot.dead_lettered_batches
            );
        }
        debug!("Shutdown report: {report:?}");
        report
    }
}
