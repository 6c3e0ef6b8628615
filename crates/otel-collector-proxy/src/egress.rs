// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, error};

use crate::batch::{BackendId, BatchId, DataSource, RecordBatch};
use crate::errors::ProxyError;
use crate::health::BackendTarget;
use crate::http_utils::build_client;

const BATCH_ID_HEADER: &str = "x-otel-proxy-batch-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Worth another attempt. `retry_after` carries the backend's hint, if any.
    RetryableFailure {
        detail: String,
        retry_after: Option<Duration>,
    },
    /// Retrying can't help, the batch is dead-lettered.
    FatalFailure { detail: String },
}

impl DeliveryOutcome {
    pub fn retryable(detail: impl Into<String>) -> Self {
        DeliveryOutcome::RetryableFailure {
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        DeliveryOutcome::FatalFailure {
            detail: detail.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::RetryableFailure { .. } => "retryable_failure",
            DeliveryOutcome::FatalFailure { .. } => "fatal_failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// Record of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttemptResult {
    pub batch_id: BatchId,
    pub backend_id: BackendId,
    pub outcome: DeliveryOutcome,
    pub latency: Duration,
}

/// Sends one batch to one backend.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, backend: &BackendTarget, batch: &RecordBatch) -> DeliveryOutcome;
}

/// Maps a backend response status to an outcome. 2xx succeeds; 408, 429 and 5xx are worth
/// retrying; any other status is permanent.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Success;
    }
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    if retryable {
        DeliveryOutcome::RetryableFailure {
            detail: format!("backend responded {status}"),
            retry_after,
        }
    } else {
        DeliveryOutcome::fatal(format!("backend responded {status}"))
    }
}

/// Parses a delay-seconds `Retry-After` value. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// OTLP/HTTP exporter towards collector backends.
pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl HttpDeliverer {
    pub fn new(proxy_url: Option<&str>, timeout: Duration) -> Result<Self, ProxyError> {
        let client =
            build_client(proxy_url, timeout).map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(HttpDeliverer { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpDeliverer { client }
    }

    /// OTLP backends get the signal path appended; Faro receivers take the configured URL as is.
    pub fn target_url(backend: &BackendTarget, batch: &RecordBatch) -> String {
        match backend.source {
            DataSource::Faro => backend.endpoint.clone(),
            DataSource::OpenTelemetrySdk => format!(
                "{}{}",
                backend.endpoint.trim_end_matches('/'),
                batch.kind().otlp_path()
            ),
        }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, backend: &BackendTarget, batch: &RecordBatch) -> DeliveryOutcome {
        let url = Self::target_url(backend, batch);
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(batch.content_type().as_header_value()),
        );
        if let Ok(id) = HeaderValue::from_str(&batch.id().to_string()) {
            headers.insert(BATCH_ID_HEADER, id);
        }

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .body(batch.payload().clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let retry_after = parse_retry_after(response.headers());
                let outcome = classify_status(status, retry_after);
                if outcome.is_success() {
                    debug!("Delivered batch {} to {url} ({status})", batch.id());
                } else {
                    let body = response.text().await.unwrap_or_default();
                    error!("{status}: Failed to deliver batch {} to {url}: {body:?}", batch.id());
                }
                outcome
            }
            Err(e) => {
                error!("Network error delivering batch {} to {url}: {e}", batch.id());
                DeliveryOutcome::retryable(format!("network error: {e}"))
            }
        }
    }
}
