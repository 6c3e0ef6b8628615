// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

use crate::batch::RecordBatch;
use crate::errors::RouteError;
use crate::health::{BackendState, BackendTarget, HealthTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// Smooth weighted round robin across backends of the same health tier.
    #[default]
    Weighted,
    /// First backend in configuration order.
    Failover,
    /// Weighted rendezvous hashing on the caller, so a caller keeps hitting the same backend.
    Hash,
}

impl RoutingMode {
    pub fn parse(value: &str) -> Option<RoutingMode> {
        match value.trim().to_ascii_lowercase().as_str() {
            "weighted" | "round_robin" => Some(RoutingMode::Weighted),
            "failover" | "priority" => Some(RoutingMode::Failover),
            "hash" | "consistent_hash" => Some(RoutingMode::Hash),
            _ => None,
        }
    }
}

/// Picks a destination for each batch from the health tracker's view of the world. Never
/// changes backend health itself.
pub struct Router {
    mode: RoutingMode,
    tracker: Arc<HealthTracker>,
    // smooth weighted round robin current weights, indexed like tracker.backends()
    current_weights: Mutex<Vec<i64>>,
}

impl Router {
    pub fn new(mode: RoutingMode, tracker: Arc<HealthTracker>) -> Self {
        let current_weights = Mutex::new(vec![0; tracker.backends().len()]);
        Router {
            mode,
            tracker,
            current_weights,
        }
    }

    pub fn route(
        &self,
        batch: &RecordBatch,
        now: Instant,
    ) -> Result<Arc<BackendTarget>, RouteError> {
        let backends = self.tracker.backends();

        if let Some(destination) = batch.destination() {
            if let Some(backend) = self.tracker.get(destination) {
                if backend.source == batch.source() && backend.state() == BackendState::Healthy {
                    return Ok(backend.clone());
                }
            }
        }

        if let Some(canary) = self.tracker.claim_canary(batch.source(), now) {
            debug!("Sending batch {} as canary to {}", batch.id(), canary.id);
            return Ok(canary);
        }

        for tier in [BackendState::Healthy, BackendState::Degraded] {
            let candidates: Vec<usize> = backends
                .iter()
                .enumerate()
                .filter(|(_, b)| b.source == batch.source() && b.state() == tier)
                .map(|(i, _)| i)
                .collect();
            if let Some(index) = self.select(&candidates, batch) {
                return Ok(backends[index].clone());
            }
        }

        Err(RouteError::NoHealthyBackend)
    }

    fn select(&self, candidates: &[usize], batch: &RecordBatch) -> Option<usize> {
        match (candidates, self.mode) {
            ([], _) => None,
            ([only], _) => Some(*only),
            (_, RoutingMode::Failover) => candidates.first().copied(),
            (_, RoutingMode::Weighted) => self.weighted(candidates),
            (_, RoutingMode::Hash) => self.rendezvous(candidates, batch),
        }
    }

    #[allow(clippy::expect_used)]
    fn weighted(&self, candidates: &[usize]) -> Option<usize> {
        let backends = self.tracker.backends();
        let mut current = self.current_weights.lock().expect("lock poisoned");
        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for &i in candidates {
            let weight = i64::from(backends[i].weight);
            current[i] += weight;
            total += weight;
            if best.map_or(true, |b| current[i] > current[b]) {
                best = Some(i);
            }
        }
        if let Some(b) = best {
            current[b] -= total;
        }
        best
    }

    fn rendezvous(&self, candidates: &[usize], batch: &RecordBatch) -> Option<usize> {
        let backends = self.tracker.backends();
        let key = batch
            .caller()
            .map(|c| c.to_string())
            .unwrap_or_else(|| batch.kind().as_str().to_string());
        candidates
            .iter()
            .map(|&i| {
                let mut hasher = fnv::FnvHasher::default();
                hasher.write(key.as_bytes());
                hasher.write(backends[i].id.as_str().as_bytes());
                // map into (0, 1) and weight it: score = -w / ln(u)
                let unit = (hasher.finish() as f64 + 1.0) / (u64::MAX as f64 + 2.0);
                let score = -f64::from(backends[i].weight) / unit.ln();
                (i, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }
}
