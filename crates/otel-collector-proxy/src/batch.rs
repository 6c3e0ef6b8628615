// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use derive_more::{Display, Into};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// OTLP signal carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TelemetryKind {
    #[display("trace")]
    Trace,
    #[display("metric")]
    Metric,
    #[display("log")]
    Log,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [
        TelemetryKind::Trace,
        TelemetryKind::Metric,
        TelemetryKind::Log,
    ];

    /// Path the OTLP/HTTP receiver of a collector listens on for this signal.
    pub fn otlp_path(&self) -> &'static str {
        match self {
            TelemetryKind::Trace => "/v1/traces",
            TelemetryKind::Metric => "/v1/metrics",
            TelemetryKind::Log => "/v1/logs",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Trace => "trace",
            TelemetryKind::Metric => "metric",
            TelemetryKind::Log => "log",
        }
    }
}

/// Producer family of a payload, selected by the `x-data-type` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Default)]
pub enum DataSource {
    #[default]
    #[display("opentelemetry-sdk")]
    OpenTelemetrySdk,
    #[display("faro")]
    Faro,
}

impl DataSource {
    /// Parses the `x-data-type` header value. `None` for anything but the two known names.
    pub fn from_header(value: &str) -> Option<DataSource> {
        match value.trim().to_ascii_lowercase().as_str() {
            "opentelemetry-sdk" => Some(DataSource::OpenTelemetrySdk),
            "faro" => Some(DataSource::Faro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::OpenTelemetrySdk => "opentelemetry-sdk",
            DataSource::Faro => "faro",
        }
    }
}

/// OTLP/HTTP payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ContentType {
    #[display("application/json")]
    Json,
    #[display("application/x-protobuf")]
    Protobuf,
}

impl ContentType {
    /// Parses a `Content-Type` header value, ignoring parameters such as `charset`.
    pub fn from_header(value: &str) -> Option<ContentType> {
        let media_type = value.split(';').next().unwrap_or_default().trim();
        match media_type.to_ascii_lowercase().as_str() {
            "application/json" => Some(ContentType::Json),
            "application/x-protobuf" | "application/protobuf" => Some(ContentType::Protobuf),
            _ => None,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Protobuf => "application/x-protobuf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into)]
pub struct BatchId(u64);

impl BatchId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn new(id: &str) -> Self {
        BackendId(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hands out monotonically increasing batch ids. Shared by admission and the batcher so
/// aggregates never collide with admitted batches.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator {
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator {
    pub fn next_id(&self) -> BatchId {
        BatchId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unit of work moving through the pipeline. A batch is owned by exactly one stage at a time;
/// only `attempt` and `destination` change after admission.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    id: BatchId,
    kind: TelemetryKind,
    source: DataSource,
    content_type: ContentType,
    payload: Bytes,
    record_count: u64,
    member_count: u64,
    received_at: Instant,
    caller: Option<Arc<str>>,
    attempt: u32,
    destination: Option<BackendId>,
}

impl RecordBatch {
    pub fn new(
        id: BatchId,
        kind: TelemetryKind,
        content_type: ContentType,
        payload: Bytes,
        record_count: u64,
    ) -> Self {
        RecordBatch {
            id,
            kind,
            source: DataSource::default(),
            content_type,
            payload,
            record_count,
            member_count: 1,
            received_at: Instant::now(),
            caller: None,
            attempt: 0,
            destination: None,
        }
    }

    pub fn with_source(mut self, source: DataSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_caller(mut self, caller: Option<Arc<str>>) -> Self {
        self.caller = caller;
        self
    }

    pub(crate) fn with_received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    pub(crate) fn with_member_count(mut self, member_count: u64) -> Self {
        self.member_count = member_count;
        self
    }

    pub(crate) fn with_destination(mut self, destination: Option<BackendId>) -> Self {
        self.destination = destination;
        self
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn kind(&self) -> TelemetryKind {
        self.kind
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size used for flush thresholds. Known without decoding the payload.
    pub fn approx_size(&self) -> usize {
        self.payload.len()
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of admitted batches this batch stands for.
    pub fn member_count(&self) -> u64 {
        self.member_count
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn caller(&self) -> Option<&Arc<str>> {
        self.caller.as_ref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn destination(&self) -> Option<&BackendId> {
        self.destination.as_ref()
    }

    pub(crate) fn record_attempt(&mut self, backend: Option<BackendId>) {
        self.attempt = self.attempt.saturating_add(1);
        if backend.is_some() {
            self.destination = backend;
        }
    }
}
