// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::RecordBatch;

/// Reasons a request is refused before it ever reaches a queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Too Many Requests")]
    RateLimited,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Unexpected data type: {0}")]
    UnexpectedDataType(String),

    #[error("Proxy is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    /// Label used for the rejected-batches counter.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::PayloadTooLarge { .. } => "payload_too_large",
            AdmissionError::RateLimited => "rate_limited",
            AdmissionError::Malformed(_) => "malformed",
            AdmissionError::UnsupportedContentType(_) => "unsupported_content_type",
            AdmissionError::UnexpectedDataType(_) => "unexpected_data_type",
            AdmissionError::ShuttingDown => "shutting_down",
        }
    }
}

/// A refused enqueue hands the batch back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Queue is full")]
    Full(RecordBatch),

    #[error("Queue is closed")]
    Closed(RecordBatch),
}

impl EnqueueError {
    pub fn into_batch(self) -> RecordBatch {
        match self {
            EnqueueError::Full(batch) | EnqueueError::Closed(batch) => batch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("Queue is empty")]
    Empty,

    #[error("Queue is closed and drained")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No healthy backend available")]
    NoHealthyBackend,
}

/// Everything an ingest call can fail with, as seen by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Ingress queue is full")]
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(String),
}
