// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::batch::{ContentType, DataSource, IdGenerator, RecordBatch, TelemetryKind};
use crate::errors::{AdmissionError, ConfigError};
use crate::metrics;
use crate::rate_limit::{AdmissionRateLimiter, RateLimitScope};

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub max_batch_bytes: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_scope: RateLimitScope,
}

/// An inbound export request, reduced to what admission needs to look at.
#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub kind: TelemetryKind,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub data_type: Option<String>,
    pub record_count: Option<String>,
    pub caller: Option<String>,
}

impl IngressRequest {
    /// A request from an OpenTelemetry SDK. Use [`IngressRequest::with_data_type`] for others.
    pub fn new(kind: TelemetryKind, content_type: &str, payload: impl Into<Bytes>) -> Self {
        IngressRequest {
            kind,
            payload: payload.into(),
            content_type: Some(content_type.to_string()),
            data_type: Some(DataSource::OpenTelemetrySdk.as_str().to_string()),
            record_count: None,
            caller: None,
        }
    }

    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = Some(caller.to_string());
        self
    }

    pub fn with_record_count(mut self, count: u64) -> Self {
        self.record_count = Some(count.to_string());
        self
    }

    pub fn with_data_type(mut self, data_type: &str) -> Self {
        self.data_type = Some(data_type.to_string());
        self
    }
}

/// Proof that a caller passed the shutdown and rate limit checks. Only
/// [`AdmissionController::clear_caller`] hands these out, so a payload can't be admitted
/// without its caller having spent a rate limit token first.
#[derive(Debug)]
#[must_use]
pub struct CallerClearance {
    _private: (),
}

/// Decides synchronously whether an inbound batch enters the pipeline.
///
/// Checks run in a fixed order: shutdown, rate limit, size, then content validation. The first
/// two only look at the caller and can run before the body is read. A rejected request never
/// reaches a queue.
pub struct AdmissionController {
    config: AdmissionConfig,
    limiter: AdmissionRateLimiter,
    ids: Arc<IdGenerator>,
    closed: AtomicBool,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, ids: Arc<IdGenerator>) -> Result<Self, ConfigError> {
        let limiter = AdmissionRateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window,
            config.rate_limit_scope,
        )?;
        Ok(AdmissionController {
            config,
            limiter,
            ids,
            closed: AtomicBool::new(false),
        })
    }

    pub fn max_batch_bytes(&self) -> usize {
        self.config.max_batch_bytes
    }

    /// Stops admitting. Every later call to [`AdmissionController::admit`] fails with
    /// `ShuttingDown`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn admit(&self, request: IngressRequest) -> Result<RecordBatch, AdmissionError> {
        let clearance = self.clear_caller(request.caller.as_deref())?;
        self.admit_cleared(clearance, request)
    }

    /// Runs the checks that need no payload. Spends one rate limit token on success.
    pub fn clear_caller(&self, caller: Option<&str>) -> Result<CallerClearance, AdmissionError> {
        if self.is_closed() {
            return Err(rejected(AdmissionError::ShuttingDown));
        }
        if !self.limiter.allow(caller) {
            return Err(rejected(AdmissionError::RateLimited));
        }
        Ok(CallerClearance { _private: () })
    }

    /// Admits a request whose caller was already cleared. Shutdown is checked again since
    /// it may have started while the body was being read.
    pub fn admit_cleared(
        &self,
        _clearance: CallerClearance,
        request: IngressRequest,
    ) -> Result<RecordBatch, AdmissionError> {
        match self.check_payload(request) {
            Ok(batch) => {
                metrics::report_admitted(batch.kind());
                debug!(
                    "Admitted {} batch {} ({} bytes, {} records)",
                    batch.kind(),
                    batch.id(),
                    batch.approx_size(),
                    batch.record_count()
                );
                Ok(batch)
            }
            Err(e) => Err(rejected(e)),
        }
    }

    fn check_payload(&self, request: IngressRequest) -> Result<RecordBatch, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::ShuttingDown);
        }

        let size = request.payload.len();
        if size > self.config.max_batch_bytes {
            return Err(AdmissionError::PayloadTooLarge {
                size,
                limit: self.config.max_batch_bytes,
            });
        }

        let content_type = match request.content_type.as_deref() {
            None => {
                return Err(AdmissionError::Malformed(
                    "Missing Content-Type header".to_string(),
                ))
            }
            Some(value) => ContentType::from_header(value)
                .ok_or_else(|| AdmissionError::UnsupportedContentType(value.to_string()))?,
        };

        let source = match request.data_type.as_deref() {
            None => return Err(AdmissionError::UnexpectedDataType("missing".to_string())),
            Some(value) => DataSource::from_header(value)
                .ok_or_else(|| AdmissionError::UnexpectedDataType(value.to_string()))?,
        };

        if request.payload.is_empty() {
            return Err(AdmissionError::Malformed("Empty payload".to_string()));
        }

        let record_count = match request.record_count.as_deref() {
            None => 1,
            Some(value) => value.trim().parse::<u64>().map_err(|_| {
                AdmissionError::Malformed(format!("Invalid record count: {value}"))
            })?,
        };

        Ok(RecordBatch::new(
            self.ids.next_id(),
            request.kind,
            content_type,
            request.payload,
            record_count,
        )
        .with_source(source)
        .with_caller(request.caller.as_deref().map(Arc::from)))
    }
}

fn rejected(error: AdmissionError) -> AdmissionError {
    metrics::report_rejected(error.reason());
    debug!("Rejected batch: {error}");
    error
}
