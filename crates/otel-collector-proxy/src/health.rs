// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-backend circuit breaker.
//!
//! ```text
//!            N consecutive failures           M more failures
//!  Healthy ───────────────────────▶ Degraded ────────────────▶ Unavailable
//!     ▲                                │                           │
//!     └──────────── any success ───────┴───────────────────────────┘
//! ```
//!
//! Unavailable backends are not routed to except for one canary batch per canary interval.
//! The transition function is pure so the state machine can be exercised without a network.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::batch::{BackendId, DataSource};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Healthy,
    Degraded,
    Unavailable,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Healthy => "healthy",
            BackendState::Degraded => "degraded",
            BackendState::Unavailable => "unavailable",
        }
    }

    /// 0 healthy, 1 degraded, 2 unavailable.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BackendState::Healthy => 0.0,
            BackendState::Degraded => 1.0,
            BackendState::Unavailable => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failures that take a healthy backend to degraded (N).
    pub degraded_after: u32,
    /// Further consecutive failures that take a degraded backend to unavailable (M).
    pub unavailable_after: u32,
    /// A healthy backend's failure streak restarts when failures are further apart than this.
    pub failure_window: Duration,
    pub canary_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub state: BackendState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub last_canary_at: Option<Instant>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        BackendHealth {
            state: BackendState::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_canary_at: None,
        }
    }
}

impl BackendHealth {
    pub fn transition(&self, event: HealthEvent, policy: &HealthPolicy, now: Instant) -> Self {
        match event {
            HealthEvent::Success => BackendHealth {
                state: BackendState::Healthy,
                consecutive_failures: 0,
                last_success_at: Some(now),
                ..self.clone()
            },
            HealthEvent::Failure => {
                let streak_expired = self.state == BackendState::Healthy
                    && self.last_failure_at.is_some_and(|last| {
                        now.saturating_duration_since(last) > policy.failure_window
                    });
                let consecutive_failures = if streak_expired {
                    1
                } else {
                    self.consecutive_failures.saturating_add(1)
                };

                let unavailable_at = policy.degraded_after.saturating_add(policy.unavailable_after);
                let state = match self.state {
                    BackendState::Healthy if consecutive_failures >= unavailable_at => {
                        BackendState::Unavailable
                    }
                    BackendState::Healthy if consecutive_failures >= policy.degraded_after => {
                        BackendState::Degraded
                    }
                    BackendState::Degraded if consecutive_failures >= unavailable_at => {
                        BackendState::Unavailable
                    }
                    state => state,
                };

                BackendHealth {
                    state,
                    consecutive_failures,
                    last_failure_at: Some(now),
                    ..self.clone()
                }
            }
        }
    }

    /// Whether an unavailable backend is due for a canary.
    pub fn canary_due(&self, policy: &HealthPolicy, now: Instant) -> bool {
        if self.state != BackendState::Unavailable {
            return false;
        }
        let since = match (self.last_canary_at, self.last_failure_at) {
            (Some(canary), Some(failure)) => canary.max(failure),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => return true,
        };
        now.saturating_duration_since(since) >= policy.canary_interval
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub id: String,
    pub endpoint: String,
    pub weight: u32,
    pub source: DataSource,
}

/// A configured delivery target. Created at startup, lives for the whole run.
#[derive(Debug)]
pub struct BackendTarget {
    pub id: BackendId,
    pub endpoint: String,
    pub weight: u32,
    pub source: DataSource,
    health: Mutex<BackendHealth>,
}

impl BackendTarget {
    pub fn new(config: &BackendConfig) -> Self {
        BackendTarget {
            id: BackendId::new(&config.id),
            endpoint: config.endpoint.clone(),
            weight: config.weight.max(1),
            source: config.source,
            health: Mutex::new(BackendHealth::default()),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, BackendHealth> {
        self.health.lock().expect("lock poisoned")
    }

    pub fn health(&self) -> BackendHealth {
        self.lock().clone()
    }

    pub fn state(&self) -> BackendState {
        self.lock().state
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub endpoint: String,
    pub source: &'static str,
    pub weight: u32,
    pub state: BackendState,
    pub consecutive_failures: u32,
}

/// Owns the health of every backend. The only writer of [`BackendHealth`].
#[derive(Debug)]
pub struct HealthTracker {
    policy: HealthPolicy,
    backends: Vec<Arc<BackendTarget>>,
}

impl HealthTracker {
    pub fn new(configs: &[BackendConfig], policy: HealthPolicy) -> Self {
        let backends = configs
            .iter()
            .map(|config| Arc::new(BackendTarget::new(config)))
            .collect::<Vec<_>>();
        for backend in &backends {
            metrics::report_backend_state(backend.id.as_str(), BackendState::Healthy);
        }
        HealthTracker { policy, backends }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn backends(&self) -> &[Arc<BackendTarget>] {
        &self.backends
    }

    pub fn get(&self, id: &BackendId) -> Option<&Arc<BackendTarget>> {
        self.backends.iter().find(|b| &b.id == id)
    }

    /// Applies a delivery outcome and returns the resulting state.
    pub fn report(&self, id: &BackendId, event: HealthEvent, now: Instant) -> Option<BackendState> {
        let backend = self.get(id)?;
        let (previous, next) = {
            let mut health = backend.lock();
            let previous = health.state;
            *health = health.transition(event, &self.policy, now);
            (previous, health.clone())
        };

        if previous != next.state {
            match next.state {
                BackendState::Healthy => info!("Backend {id} recovered, now healthy"),
                state => warn!(
                    "Backend {id} is now {} after {} consecutive failures",
                    state.as_str(),
                    next.consecutive_failures
                ),
            }
            metrics::report_backend_state(id.as_str(), next.state);
        }
        Some(next.state)
    }

    /// Claims the canary slot of the first unavailable backend for `source` whose canary is due.
    /// The claim is recorded immediately so concurrent callers cannot claim the same backend
    /// twice in one interval.
    pub fn claim_canary(&self, source: DataSource, now: Instant) -> Option<Arc<BackendTarget>> {
        self.backends
            .iter()
            .filter(|backend| backend.source == source)
            .find(|backend| {
                let mut health = backend.lock();
                if health.canary_due(&self.policy, now) {
                    health.last_canary_at = Some(now);
                    true
                } else {
                    false
                }
            })
            .cloned()
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|backend| {
                let health = backend.health();
                BackendStatus {
                    id: backend.id.to_string(),
                    endpoint: backend.endpoint.clone(),
                    source: backend.source.as_str(),
                    weight: backend.weight,
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn policy(n: u32, m: u32) -> HealthPolicy {
        HealthPolicy {
            degraded_after: n,
            unavailable_after: m,
            failure_window: Duration::from_secs(30),
            canary_interval: Duration::from_secs(5),
        }
    }

    fn fail_times(
        health: BackendHealth,
        times: u32,
        policy: &HealthPolicy,
        now: Instant,
    ) -> BackendHealth {
        (0..times).fold(health, |h, _| h.transition(HealthEvent::Failure, policy, now))
    }

    #[test]
    fn test_n_failures_degrade() {
        let policy = policy(3, 2);
        let now = Instant::now();
        let health = fail_times(BackendHealth::default(), 2, &policy, now);
        assert_eq!(health.state, BackendState::Healthy);
        let health = health.transition(HealthEvent::Failure, &policy, now);
        assert_eq!(health.state, BackendState::Degraded);
        assert_eq!(health.consecutive_failures, 3);
    }

    #[test]
    fn test_n_plus_m_failures_make_unavailable() {
        let policy = policy(3, 2);
        let now = Instant::now();
        let health = fail_times(BackendHealth::default(), 4, &policy, now);
        assert_eq!(health.state, BackendState::Degraded);
        let health = health.transition(HealthEvent::Failure, &policy, now);
        assert_eq!(health.state, BackendState::Unavailable);
    }

    #[test]
    fn test_success_restores_from_any_state() {
        let policy = policy(1, 1);
        let now = Instant::now();
        for failures in 0..4 {
            let health = fail_times(BackendHealth::default(), failures, &policy, now)
                .transition(HealthEvent::Success, &policy, now);
            assert_eq!(health.state, BackendState::Healthy);
            assert_eq!(health.consecutive_failures, 0);
            assert_eq!(health.last_success_at, Some(now));
        }
    }

    #[test]
    fn test_success_resets_streak() {
        let policy = policy(3, 2);
        let now = Instant::now();
        let health = fail_times(BackendHealth::default(), 2, &policy, now)
            .transition(HealthEvent::Success, &policy, now);
        let health = fail_times(health, 2, &policy, now);
        assert_eq!(health.state, BackendState::Healthy);
    }

    #[test]
    fn test_failures_outside_window_restart_streak() {
        let policy = policy(2, 2);
        let start = Instant::now();
        let health = BackendHealth::default().transition(HealthEvent::Failure, &policy, start);
        let later = start + Duration::from_secs(31);
        let health = health.transition(HealthEvent::Failure, &policy, later);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.state, BackendState::Healthy);
    }

    #[test]
    fn test_canary_due_after_interval() {
        let policy = policy(1, 1);
        let now = Instant::now();
        let health = fail_times(BackendHealth::default(), 2, &policy, now);
        assert_eq!(health.state, BackendState::Unavailable);
        assert!(!health.canary_due(&policy, now + Duration::from_secs(1)));
        assert!(health.canary_due(&policy, now + Duration::from_secs(5)));
    }

    fn tracker(policy: HealthPolicy) -> HealthTracker {
        HealthTracker::new(
            &[BackendConfig {
                id: "primary".to_string(),
                endpoint: "http://localhost:4318".to_string(),
                weight: 1,
                source: DataSource::OpenTelemetrySdk,
            }],
            policy,
        )
    }

    #[test]
    fn test_claim_canary_once_per_interval() {
        let tracker = tracker(policy(1, 1));
        let id = BackendId::new("primary");
        let now = Instant::now();
        tracker.report(&id, HealthEvent::Failure, now);
        tracker.report(&id, HealthEvent::Failure, now);
        assert_eq!(tracker.backends()[0].state(), BackendState::Unavailable);

        let due = now + Duration::from_secs(5);
        assert!(tracker.claim_canary(DataSource::OpenTelemetrySdk, due).is_some());
        assert!(tracker.claim_canary(DataSource::OpenTelemetrySdk, due).is_none());
        assert!(tracker.claim_canary(DataSource::Faro, due + Duration::from_secs(10)).is_none());
    }

    #[test]
    #[traced_test]
    fn test_state_changes_are_logged() {
        let tracker = tracker(policy(1, 5));
        let id = BackendId::new("primary");
        let now = Instant::now();
        assert_eq!(
            tracker.report(&id, HealthEvent::Failure, now),
            Some(BackendState::Degraded)
        );
        assert!(logs_contain("Backend primary is now degraded"));
        assert_eq!(
            tracker.report(&id, HealthEvent::Success, now),
            Some(BackendState::Healthy)
        );
        assert!(logs_contain("Backend primary recovered"));
        assert_eq!(tracker.report(&BackendId::new("unknown"), HealthEvent::Success, now), None);
    }
}
