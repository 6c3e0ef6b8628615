// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus exposition of pipeline counters.
//!
//! Everything here is write-only from the pipeline's point of view: no component reads a metric
//! back to make a decision. Health and delivery accounting keep their own state in
//! [`crate::health`] and [`crate::ledger`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{
    Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::batch::TelemetryKind;
use crate::errors::ProxyError;
use crate::health::BackendState;

pub const BATCHES_ADMITTED: &str = "otel_proxy_batches_admitted_total";
pub const BATCHES_REJECTED: &str = "otel_proxy_batches_rejected_total";
pub const BATCHES_ENQUEUED: &str = "otel_proxy_batches_enqueued_total";
pub const BATCHES_DEQUEUED: &str = "otel_proxy_batches_dequeued_total";
pub const BATCHES_FLUSHED: &str = "otel_proxy_batches_flushed_total";
pub const DELIVERIES: &str = "otel_proxy_deliveries_total";
pub const BATCHES_DROPPED: &str = "otel_proxy_batches_dropped_total";
pub const RECORDS_DROPPED: &str = "otel_proxy_records_dropped_total";
pub const QUEUE_DEPTH: &str = "otel_proxy_queue_depth";
pub const BACKEND_STATE: &str = "otel_proxy_backend_state";
pub const DELIVERY_LATENCY: &str = "otel_proxy_delivery_latency_seconds";
pub const FLUSH_SIZE: &str = "otel_proxy_flush_size_bytes";

pub const HTTP_REQUESTS: &str = "otel_proxy_http_requests_total";
pub const HTTP_RESPONSES: &str = "otel_proxy_http_responses_total";
pub const HTTP_REQUEST_DURATION: &str = "otel_proxy_http_request_duration_seconds";
pub const HTTP_REQUESTS_IN_PROGRESS: &str = "otel_proxy_http_requests_in_progress";

const SNAPSHOT_FILE_NAME: &str = "otel_collector_proxy.prom";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const SIZE_BUCKETS: &[f64] = &[
    1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
];

pub fn report_admitted(kind: TelemetryKind) {
    counter!(BATCHES_ADMITTED, "kind" => kind.as_str()).increment(1);
}

pub fn report_rejected(reason: &'static str) {
    counter!(BATCHES_REJECTED, "reason" => reason).increment(1);
}

pub fn report_enqueued(queue: &'static str, depth: usize) {
    counter!(BATCHES_ENQUEUED, "queue" => queue).increment(1);
    gauge!(QUEUE_DEPTH, "queue" => queue).set(depth as f64);
}

pub fn report_dequeued(queue: &'static str, depth: usize) {
    counter!(BATCHES_DEQUEUED, "queue" => queue).increment(1);
    gauge!(QUEUE_DEPTH, "queue" => queue).set(depth as f64);
}

pub fn report_queue_depth(queue: &'static str, depth: usize) {
    gauge!(QUEUE_DEPTH, "queue" => queue).set(depth as f64);
}

pub fn report_flushed(kind: TelemetryKind, trigger: &'static str, size: usize) {
    counter!(BATCHES_FLUSHED, "kind" => kind.as_str(), "trigger" => trigger).increment(1);
    histogram!(FLUSH_SIZE).record(size as f64);
}

pub fn report_delivery(backend: &str, outcome: &'static str, latency: Duration) {
    counter!(DELIVERIES, "backend" => backend.to_string(), "outcome" => outcome).increment(1);
    histogram!(DELIVERY_LATENCY, "backend" => backend.to_string())
        .record(latency.as_secs_f64());
}

/// Counts in admitted batches, like the ledger, so an aggregate of five counts five.
pub fn report_dropped(reason: &'static str, batches: u64, records: u64) {
    counter!(BATCHES_DROPPED, "reason" => reason).increment(batches);
    counter!(RECORDS_DROPPED, "reason" => reason).increment(records);
}

pub fn report_backend_state(backend: &str, state: BackendState) {
    gauge!(BACKEND_STATE, "backend" => backend.to_string()).set(state.as_gauge());
}

/// Per-request HTTP metrics, modelled on a request/response middleware.
pub struct HttpRequestMetrics {
    method: String,
    path: String,
    started: std::time::Instant,
}

impl HttpRequestMetrics {
    pub fn start(method: &str, path: &str) -> Self {
        let method = method.to_string();
        let path = path.to_string();
        counter!(HTTP_REQUESTS, "method" => method.clone(), "path" => path.clone()).increment(1);
        gauge!(HTTP_REQUESTS_IN_PROGRESS, "method" => method.clone(), "path" => path.clone())
            .increment(1.0);
        HttpRequestMetrics {
            method,
            path,
            started: std::time::Instant::now(),
        }
    }

    pub fn finish(self, status: u16) {
        let labels = [
            ("method", self.method.clone()),
            ("path", self.path.clone()),
            ("status_code", status.to_string()),
        ];
        counter!(HTTP_RESPONSES, &labels).increment(1);
        histogram!(HTTP_REQUEST_DURATION, &labels)
            .record(self.started.elapsed().as_secs_f64());
        gauge!(HTTP_REQUESTS_IN_PROGRESS, "method" => self.method, "path" => self.path)
            .decrement(1.0);
    }
}

fn builder() -> Result<PrometheusBuilder, ProxyError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)
        .and_then(|b| {
            b.set_buckets_for_metric(Matcher::Full(FLUSH_SIZE.to_string()), SIZE_BUCKETS)
        })
        .map_err(|e| ProxyError::Metrics(e.to_string()))
}

/// Builds a recorder without installing it globally. Used by tests with
/// [`metrics::with_local_recorder`].
pub fn build_recorder() -> Result<PrometheusRecorder, ProxyError> {
    Ok(builder()?.build_recorder())
}

/// Renders the Prometheus exposition and optionally mirrors it into a scratch directory.
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
    snapshot_dir: Option<PathBuf>,
}

impl MetricsExporter {
    /// Installs the process-wide recorder. Call once per process.
    pub fn install(snapshot_dir: Option<PathBuf>) -> Result<Self, ProxyError> {
        let handle = builder()?
            .install_recorder()
            .map_err(|e| ProxyError::Metrics(e.to_string()))?;
        Ok(MetricsExporter {
            handle,
            snapshot_dir,
        })
    }

    pub fn from_handle(handle: PrometheusHandle, snapshot_dir: Option<PathBuf>) -> Self {
        MetricsExporter {
            handle,
            snapshot_dir,
        }
    }

    pub async fn render(&self) -> String {
        let rendered = self.handle.render();
        if let Some(dir) = &self.snapshot_dir {
            write_snapshot(dir, &rendered).await;
        }
        rendered
    }

    /// Writes the current exposition to the scratch directory, if one is configured.
    pub async fn write_snapshot(&self) {
        if let Some(dir) = &self.snapshot_dir {
            write_snapshot(dir, &self.handle.render()).await;
        }
    }
}

async fn write_snapshot(dir: &Path, rendered: &str) {
    let path = dir.join(SNAPSHOT_FILE_NAME);
    match tokio::fs::write(&path, rendered).await {
        Ok(()) => debug!("Wrote metrics snapshot to {}", path.display()),
        Err(e) => warn!("Unable to write metrics snapshot to {}: {e}", path.display()),
    }
}
