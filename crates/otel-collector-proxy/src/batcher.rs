// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulates admitted batches into larger aggregates before delivery.
//!
//! Batches are grouped by kind, source, encoding and destination (plus caller when routing by
//! hash). A group is flushed when the first of three thresholds is reached:
//!
//! * accumulated size `>= max_flush_bytes`
//! * accumulated records `>= max_flush_records`
//! * `flush_interval` elapsed since the group's first member arrived
//!
//! Reaching a threshold exactly flushes. The aggregate gets a fresh id and its members are
//! retired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::batch::{BackendId, ContentType, DataSource, IdGenerator, RecordBatch, TelemetryKind};
use crate::errors::{DequeueError, EnqueueError};
use crate::ledger::{DropReason, Ledger};
use crate::merge::MergeRegistry;
use crate::metrics;
use crate::queue::{BoundedQueue, Enqueued};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherConfig {
    pub max_flush_bytes: usize,
    pub max_flush_records: u64,
    pub flush_interval: Duration,
    /// Keep callers apart so hash routing still sees a single caller per aggregate.
    pub group_by_caller: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Bytes,
    Records,
    Interval,
    Drain,
    Unmergeable,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Bytes => "bytes",
            FlushTrigger::Records => "records",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Drain => "drain",
            FlushTrigger::Unmergeable => "unmergeable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    kind: TelemetryKind,
    source: DataSource,
    content_type: ContentType,
    destination: Option<BackendId>,
    caller: Option<Arc<str>>,
}

#[derive(Debug)]
struct Group {
    members: Vec<RecordBatch>,
    bytes: usize,
    records: u64,
    deadline: Instant,
}

pub struct Batcher {
    config: BatcherConfig,
    merges: MergeRegistry,
    ids: Arc<IdGenerator>,
    groups: HashMap<GroupKey, Group>,
}

impl Batcher {
    pub fn new(config: BatcherConfig, merges: MergeRegistry, ids: Arc<IdGenerator>) -> Self {
        Batcher {
            config,
            merges,
            ids,
            groups: HashMap::new(),
        }
    }

    /// Number of admitted batches waiting in open groups.
    pub fn pending(&self) -> usize {
        self.groups.values().map(|g| g.members.len()).sum()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups.values().map(|g| g.deadline).min()
    }

    /// Adds a batch and returns whatever it caused to flush.
    pub fn add(&mut self, batch: RecordBatch, now: Instant) -> Vec<RecordBatch> {
        if !self
            .merges
            .supports(batch.kind(), batch.source(), batch.content_type())
        {
            let trigger = FlushTrigger::Unmergeable.as_str();
            metrics::report_flushed(batch.kind(), trigger, batch.approx_size());
            return vec![batch];
        }

        let key = GroupKey {
            kind: batch.kind(),
            source: batch.source(),
            content_type: batch.content_type(),
            destination: batch.destination().cloned(),
            caller: if self.config.group_by_caller {
                batch.caller().cloned()
            } else {
                None
            },
        };
        let flush_interval = self.config.flush_interval;
        let group = self.groups.entry(key.clone()).or_insert_with(|| Group {
            members: Vec::new(),
            bytes: 0,
            records: 0,
            deadline: now + flush_interval,
        });
        group.bytes += batch.approx_size();
        group.records += batch.record_count();
        group.members.push(batch);

        let trigger = if group.bytes >= self.config.max_flush_bytes {
            Some(FlushTrigger::Bytes)
        } else if group.records >= self.config.max_flush_records {
            Some(FlushTrigger::Records)
        } else {
            None
        };

        match trigger.and_then(|trigger| self.groups.remove(&key).map(|g| (trigger, g))) {
            Some((trigger, group)) => self.seal(key, group, trigger),
            None => Vec::new(),
        }
    }

    /// Flushes every group whose interval has elapsed.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<RecordBatch> {
        let expired: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, group)| group.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut flushed = Vec::new();
        for key in expired {
            if let Some(group) = self.groups.remove(&key) {
                flushed.extend(self.seal(key, group, FlushTrigger::Interval));
            }
        }
        flushed
    }

    /// Flushes every open group regardless of thresholds.
    pub fn flush_all(&mut self) -> Vec<RecordBatch> {
        let groups: Vec<(GroupKey, Group)> = self.groups.drain().collect();
        let mut flushed = Vec::new();
        for (key, group) in groups {
            flushed.extend(self.seal(key, group, FlushTrigger::Drain));
        }
        flushed
    }

    fn seal(&self, key: GroupKey, group: Group, trigger: FlushTrigger) -> Vec<RecordBatch> {
        let Group {
            members,
            bytes,
            records,
            ..
        } = group;

        let payload = match members.as_slice() {
            [only] => Ok(only.payload().clone()),
            _ => {
                let payloads: Vec<_> = members.iter().map(|m| m.payload().clone()).collect();
                match self.merges.get(key.kind) {
                    Some(strategy) => strategy.merge(key.content_type, &payloads),
                    None => Err(crate::merge::MergeError::Unsupported(key.kind.to_string())),
                }
            }
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Unable to merge {} {} batches, forwarding them unmerged: {e}",
                    members.len(),
                    key.kind
                );
                for member in &members {
                    let trigger = FlushTrigger::Unmergeable.as_str();
                    metrics::report_flushed(key.kind, trigger, member.approx_size());
                }
                return members;
            }
        };

        let member_count = members.iter().map(RecordBatch::member_count).sum();
        let received_at = members
            .iter()
            .map(RecordBatch::received_at)
            .min()
            .unwrap_or_else(std::time::Instant::now);
        let caller = if members
            .iter()
            .all(|m| m.caller() == members[0].caller())
        {
            members[0].caller().cloned()
        } else {
            None
        };

        let aggregate = RecordBatch::new(
            self.ids.next_id(),
            key.kind,
            key.content_type,
            payload,
            records,
        )
        .with_source(key.source)
        .with_caller(caller)
        .with_received_at(received_at)
        .with_member_count(member_count)
        .with_destination(key.destination);

        debug!(
            "Flushed {} {} batches into {} ({} bytes, {} records, trigger: {})",
            members.len(),
            key.kind,
            aggregate.id(),
            bytes,
            records,
            trigger.as_str()
        );
        metrics::report_flushed(key.kind, trigger.as_str(), aggregate.approx_size());
        vec![aggregate]
    }
}

/// Runs a [`Batcher`] between the ingress and dispatch queues.
///
/// Exits once the ingress queue is closed and drained, after flushing every partial group.
pub struct BatcherService {
    batcher: Batcher,
    ingress: Arc<BoundedQueue>,
    dispatch: Arc<BoundedQueue>,
    ledger: Arc<Ledger>,
}

impl BatcherService {
    pub fn new(
        batcher: Batcher,
        ingress: Arc<BoundedQueue>,
        dispatch: Arc<BoundedQueue>,
        ledger: Arc<Ledger>,
    ) -> Self {
        BatcherService {
            batcher,
            ingress,
            dispatch,
            ledger,
        }
    }

    pub async fn run(mut self) {
        debug!("Batcher service started");
        let idle_wait = self.batcher.config.flush_interval;

        loop {
            let wait = self
                .batcher
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(idle_wait);

            match self.ingress.dequeue(Some(wait)).await {
                Ok(batch) => {
                    let flushed = self.batcher.add(batch, Instant::now());
                    self.forward(flushed).await;
                }
                Err(DequeueError::Empty) => {}
                Err(DequeueError::Closed) => break,
            }

            let expired = self.batcher.flush_expired(Instant::now());
            self.forward(expired).await;
        }

        let remaining = self.batcher.flush_all();
        debug!(
            "Batcher service stopping, flushing {} partial aggregates",
            remaining.len()
        );
        self.forward(remaining).await;
    }

    async fn forward(&self, batches: Vec<RecordBatch>) {
        for batch in batches {
            match self.dispatch.enqueue(batch).await {
                Ok(Enqueued::Accepted) => {}
                Ok(Enqueued::Evicted(evicted)) => {
                    self.ledger.dead_letter(evicted, DropReason::Shed)
                }
                Err(EnqueueError::Full(batch)) => {
                    self.ledger.dead_letter(batch, DropReason::QueueFull)
                }
                Err(EnqueueError::Closed(batch)) => {
                    self.ledger.dead_letter(batch, DropReason::Shutdown)
                }
            }
        }
    }
}
