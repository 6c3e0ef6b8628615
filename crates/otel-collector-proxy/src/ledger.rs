// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::batch::RecordBatch;
use crate::metrics;

/// Why a batch left the pipeline without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Retryable failures until the attempt budget ran out.
    Exhausted,
    /// Rejected by the backend in a way retrying can't fix.
    Fatal,
    NoHealthyBackend,
    /// A full downstream queue refused the batch.
    QueueFull,
    /// Evicted to make room under `DropOldest`.
    Shed,
    Shutdown,
    Internal,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Exhausted => "exhausted",
            DropReason::Fatal => "fatal",
            DropReason::NoHealthyBackend => "no_healthy_backend",
            DropReason::QueueFull => "queue_full",
            DropReason::Shed => "shed",
            DropReason::Shutdown => "shutdown",
            DropReason::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerSnapshot {
    pub admitted_batches: u64,
    pub admitted_records: u64,
    pub delivered_batches: u64,
    pub delivered_records: u64,
    pub dead_lettered_batches: u64,
    pub dead_lettered_records: u64,
    pub shed_batches: u64,
    pub shed_records: u64,
    pub outstanding_batches: u64,
}

/// Exact accounting of every admitted batch.
///
/// Counts are in admitted batches (members), so an aggregate of five admitted batches resolves
/// five at once. A batch is outstanding from the moment it is admitted until it is delivered,
/// dead-lettered or shed.
#[derive(Debug, Default)]
pub struct Ledger {
    admitted_batches: AtomicU64,
    admitted_records: AtomicU64,
    delivered_batches: AtomicU64,
    delivered_records: AtomicU64,
    dead_lettered_batches: AtomicU64,
    dead_lettered_records: AtomicU64,
    shed_batches: AtomicU64,
    shed_records: AtomicU64,
    resolved: Notify,
}

impl Ledger {
    pub fn admitted(&self, batch: &RecordBatch) {
        self.admitted_batches
            .fetch_add(batch.member_count(), Ordering::SeqCst);
        self.admitted_records
            .fetch_add(batch.record_count(), Ordering::SeqCst);
    }

    /// Undoes [`Ledger::admitted`] for a batch that never made it into the pipeline.
    pub fn withdraw(&self, batch: &RecordBatch) {
        self.admitted_batches
            .fetch_sub(batch.member_count(), Ordering::SeqCst);
        self.admitted_records
            .fetch_sub(batch.record_count(), Ordering::SeqCst);
        self.resolved.notify_waiters();
    }

    pub fn delivered(&self, batch: RecordBatch) {
        self.delivered_batches
            .fetch_add(batch.member_count(), Ordering::SeqCst);
        self.delivered_records
            .fetch_add(batch.record_count(), Ordering::SeqCst);
        self.resolved.notify_waiters();
    }

    /// Terminal accounting for an undeliverable batch. Takes ownership so nothing can touch it
    /// afterwards.
    pub fn dead_letter(&self, batch: RecordBatch, reason: DropReason) {
        warn!(
            "Dead-lettering {} batch {} ({} records, {} attempts): {}",
            batch.kind(),
            batch.id(),
            batch.record_count(),
            batch.attempt(),
            reason.as_str()
        );
        metrics::report_dropped(
            reason.as_str(),
            batch.member_count(),
            batch.record_count(),
        );
        if reason == DropReason::Shed {
            self.shed_batches
                .fetch_add(batch.member_count(), Ordering::SeqCst);
            self.shed_records
                .fetch_add(batch.record_count(), Ordering::SeqCst);
        } else {
            self.dead_lettered_batches
                .fetch_add(batch.member_count(), Ordering::SeqCst);
            self.dead_lettered_records
                .fetch_add(batch.record_count(), Ordering::SeqCst);
        }
        self.resolved.notify_waiters();
    }

    pub fn outstanding(&self) -> u64 {
        let resolved = self.delivered_batches.load(Ordering::SeqCst)
            + self.dead_lettered_batches.load(Ordering::SeqCst)
            + self.shed_batches.load(Ordering::SeqCst);
        self.admitted_batches
            .load(Ordering::SeqCst)
            .saturating_sub(resolved)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            admitted_batches: self.admitted_batches.load(Ordering::SeqCst),
            admitted_records: self.admitted_records.load(Ordering::SeqCst),
            delivered_batches: self.delivered_batches.load(Ordering::SeqCst),
            delivered_records: self.delivered_records.load(Ordering::SeqCst),
            dead_lettered_batches: self.dead_lettered_batches.load(Ordering::SeqCst),
            dead_lettered_records: self.dead_lettered_records.load(Ordering::SeqCst),
            shed_batches: self.shed_batches.load(Ordering::SeqCst),
            shed_records: self.shed_records.load(Ordering::SeqCst),
            outstanding_batches: self.outstanding(),
        }
    }

    /// Waits until nothing is outstanding. Returns false if `deadline` passes first.
    pub async fn wait_drained(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }
}
