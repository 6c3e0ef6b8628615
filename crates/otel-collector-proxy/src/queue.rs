// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::batch::RecordBatch;
use crate::errors::{DequeueError, EnqueueError};
use crate::metrics;

/// What to do with an enqueue when every slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the incoming batch.
    DropNewest,
    /// Evict the oldest queued batch to make room.
    DropOldest,
    /// Wait up to the given duration for a slot, then refuse.
    BlockWithTimeout(Duration),
}

/// Result of a successful enqueue.
#[derive(Debug)]
pub enum Enqueued {
    Accepted,
    /// The batch was queued after evicting this one; the caller owns the evicted batch.
    Evicted(RecordBatch),
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<RecordBatch>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer FIFO of record batches.
///
/// The number of queued batches never exceeds `capacity`. Closing the queue refuses new batches
/// while consumers keep draining what is left; `dequeue` reports `Closed` only once empty.
#[derive(Debug)]
pub struct BoundedQueue {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<State>,
    not_empty: Notify,
    not_full: Notify,
}

impl BoundedQueue {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        BoundedQueue {
            name,
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("lock poisoned")
    }

    /// Enqueues without waiting. `BlockWithTimeout` behaves like `DropNewest` here.
    pub fn try_enqueue(&self, batch: RecordBatch) -> Result<Enqueued, EnqueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EnqueueError::Closed(batch));
        }
        if state.items.len() < self.capacity {
            state.items.push_back(batch);
            let depth = state.items.len();
            drop(state);
            self.not_empty.notify_one();
            metrics::report_enqueued(self.name, depth);
            return Ok(Enqueued::Accepted);
        }
        match self.policy {
            OverflowPolicy::DropOldest => {
                let evicted = state.items.pop_front();
                state.items.push_back(batch);
                let depth = state.items.len();
                drop(state);
                self.not_empty.notify_one();
                metrics::report_enqueued(self.name, depth);
                match evicted {
                    Some(evicted) => {
                        debug!(
                            "Queue {} evicted batch {} to admit a newer one",
                            self.name,
                            evicted.id()
                        );
                        Ok(Enqueued::Evicted(evicted))
                    }
                    None => Ok(Enqueued::Accepted),
                }
            }
            OverflowPolicy::DropNewest | OverflowPolicy::BlockWithTimeout(_) => {
                Err(EnqueueError::Full(batch))
            }
        }
    }

    /// Enqueues according to the overflow policy, waiting for a free slot under
    /// `BlockWithTimeout`.
    pub async fn enqueue(&self, batch: RecordBatch) -> Result<Enqueued, EnqueueError> {
        let timeout = match self.policy {
            OverflowPolicy::BlockWithTimeout(timeout) => timeout,
            OverflowPolicy::DropNewest | OverflowPolicy::DropOldest => {
                return self.try_enqueue(batch)
            }
        };

        let deadline = Instant::now() + timeout;
        let mut batch = batch;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(batch) {
                Err(EnqueueError::Full(returned)) => batch = returned,
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // one last attempt, a slot may have opened right at the deadline
                return self.try_enqueue(batch);
            }
        }
    }

    pub fn try_dequeue(&self) -> Result<RecordBatch, DequeueError> {
        let mut state = self.lock();
        match state.items.pop_front() {
            Some(batch) => {
                let depth = state.items.len();
                drop(state);
                self.not_full.notify_one();
                metrics::report_dequeued(self.name, depth);
                Ok(batch)
            }
            None if state.closed => Err(DequeueError::Closed),
            None => Err(DequeueError::Empty),
        }
    }

    /// Takes the oldest batch, waiting up to `timeout` (forever when `None`) for one to arrive.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Result<RecordBatch, DequeueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_dequeue() {
                Err(DequeueError::Empty) => {}
                other => return other,
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_dequeue();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Refuses further enqueues and wakes every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Removes every queued batch.
    pub fn drain(&self) -> Vec<RecordBatch> {
        let drained: Vec<RecordBatch> = self.lock().items.drain(..).collect();
        self.not_full.notify_waiters();
        metrics::report_queue_depth(self.name, 0);
        drained
    }
}
