// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::batch::{ContentType, DataSource, TelemetryKind};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload has no {0} array")]
    MissingField(&'static str),

    #[error("Unsupported payload: {0}")]
    Unsupported(String),
}

/// Combines the payloads of several batches of the same kind into one payload.
pub trait MergeStrategy: Send + Sync {
    /// Whether batches with this source and encoding can be merged at all. Batches that can't
    /// are forwarded one by one.
    fn supports(&self, source: DataSource, content_type: ContentType) -> bool;

    fn merge(&self, content_type: ContentType, payloads: &[Bytes]) -> Result<Bytes, MergeError>;
}

/// Merges OTLP export requests.
///
/// Protobuf: an export request is a single repeated `resource_*` field, and concatenated
/// protobuf messages parse as the merge of both, so byte concatenation is a valid merge.
/// JSON: the top level `resource*` arrays are appended in order.
pub struct OtlpMerge {
    field: &'static str,
}

impl OtlpMerge {
    pub fn for_kind(kind: TelemetryKind) -> Self {
        let field = match kind {
            TelemetryKind::Trace => "resourceSpans",
            TelemetryKind::Metric => "resourceMetrics",
            TelemetryKind::Log => "resourceLogs",
        };
        OtlpMerge { field }
    }

    fn merge_json(&self, payloads: &[Bytes]) -> Result<Bytes, MergeError> {
        let mut merged: Vec<Value> = Vec::new();
        for payload in payloads {
            let mut request: Value = serde_json::from_slice(payload)?;
            match request.get_mut(self.field).map(Value::take) {
                Some(Value::Array(items)) => merged.extend(items),
                Some(Value::Null) | None => {}
                Some(_) => return Err(MergeError::MissingField(self.field)),
            }
        }
        let mut output = serde_json::Map::new();
        output.insert(self.field.to_string(), Value::Array(merged));
        Ok(Bytes::from(serde_json::to_vec(&Value::Object(output))?))
    }
}

impl MergeStrategy for OtlpMerge {
    fn supports(&self, source: DataSource, _content_type: ContentType) -> bool {
        source == DataSource::OpenTelemetrySdk
    }

    fn merge(&self, content_type: ContentType, payloads: &[Bytes]) -> Result<Bytes, MergeError> {
        match content_type {
            ContentType::Protobuf => {
                let total = payloads.iter().map(Bytes::len).sum();
                let mut merged = BytesMut::with_capacity(total);
                for payload in payloads {
                    merged.extend_from_slice(payload);
                }
                Ok(merged.freeze())
            }
            ContentType::Json => self.merge_json(payloads),
        }
    }
}

/// Merge strategies keyed by telemetry kind.
#[derive(Clone)]
pub struct MergeRegistry {
    strategies: HashMap<TelemetryKind, Arc<dyn MergeStrategy>>,
}

impl Default for MergeRegistry {
    fn default() -> Self {
        let mut registry = MergeRegistry {
            strategies: HashMap::new(),
        };
        for kind in TelemetryKind::ALL {
            registry.register(kind, Arc::new(OtlpMerge::for_kind(kind)));
        }
        registry
    }
}

impl MergeRegistry {
    pub fn empty() -> Self {
        MergeRegistry {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: TelemetryKind, strategy: Arc<dyn MergeStrategy>) {
        self.strategies.insert(kind, strategy);
    }

    pub fn get(&self, kind: TelemetryKind) -> Option<&Arc<dyn MergeStrategy>> {
        self.strategies.get(&kind)
    }

    pub fn supports(
        &self,
        kind: TelemetryKind,
        source: DataSource,
        content_type: ContentType,
    ) -> bool {
        self.get(kind)
            .is_some_and(|strategy| strategy.supports(source, content_type))
    }
}
