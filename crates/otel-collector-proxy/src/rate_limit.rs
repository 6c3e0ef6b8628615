// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::ConfigError;

const GLOBAL_KEY: &str = "global";

/// Which callers share a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitScope {
    /// One bucket per caller identity (client IP).
    #[default]
    PerCaller,
    /// A single bucket for all traffic.
    Global,
}

impl RateLimitScope {
    pub fn parse(value: &str) -> Option<RateLimitScope> {
        match value.trim().to_ascii_lowercase().as_str() {
            "caller" | "per_caller" | "ip" => Some(RateLimitScope::PerCaller),
            "global" => Some(RateLimitScope::Global),
            _ => None,
        }
    }
}

/// Token bucket admission limit: `requests` tokens per `window`, refilled evenly.
///
/// Idle per-caller buckets are evicted every ten windows so the key space does not grow with
/// every client that ever connected.
#[derive(Clone, Debug)]
pub struct AdmissionRateLimiter {
    scope: RateLimitScope,
    cleanup_every: Duration,
    last_cleanup: Arc<Mutex<Instant>>,
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, clock::DefaultClock>>,
}

impl AdmissionRateLimiter {
    pub fn new(
        requests: u32,
        window: Duration,
        scope: RateLimitScope,
    ) -> Result<Self, ConfigError> {
        let burst = NonZeroU32::new(requests).ok_or_else(|| {
            ConfigError::Invalid("rate limit requests must be greater than 0".to_string())
        })?;
        let period = window / requests;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                ConfigError::Invalid("rate limit window must be greater than 0".to_string())
            })?
            .allow_burst(burst);

        Ok(AdmissionRateLimiter {
            scope,
            cleanup_every: window * 10,
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
            limiter: Arc::new(RateLimiter::dashmap(quota)),
        })
    }

    /// Takes one token from the caller's bucket. Unknown callers share the global bucket.
    pub fn allow(&self, caller: Option<&str>) -> bool {
        self.maybe_cleanup();
        let key = match (self.scope, caller) {
            (RateLimitScope::PerCaller, Some(caller)) if !caller.is_empty() => caller,
            _ => GLOBAL_KEY,
        };
        self.limiter.check_key(&key.to_string()).is_ok()
    }

    /// Number of buckets currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    fn maybe_cleanup(&self) {
        let Ok(mut last_cleanup) = self.last_cleanup.try_lock() else {
            return;
        };
        if last_cleanup.elapsed() < self.cleanup_every {
            return;
        }
        *last_cleanup = Instant::now();
        drop(last_cleanup);

        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            "Rate limiter cleanup: {} of {} buckets kept",
            self.limiter.len(),
            before
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let limiter =
            AdmissionRateLimiter::new(2, Duration::from_secs(60), RateLimitScope::PerCaller)
                .unwrap();
        assert!(limiter.allow(Some("10.0.0.1")));
        assert!(limiter.allow(Some("10.0.0.1")));
        assert!(!limiter.allow(Some("10.0.0.1")));
    }

    #[test]
    fn test_callers_have_separate_buckets() {
        let limiter =
            AdmissionRateLimiter::new(1, Duration::from_secs(60), RateLimitScope::PerCaller)
                .unwrap();
        assert!(limiter.allow(Some("10.0.0.1")));
        assert!(!limiter.allow(Some("10.0.0.1")));
        assert!(limiter.allow(Some("10.0.0.2")));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_global_scope_shares_bucket() {
        let limiter =
            AdmissionRateLimiter::new(1, Duration::from_secs(60), RateLimitScope::Global).unwrap();
        assert!(limiter.allow(Some("10.0.0.1")));
        assert!(!limiter.allow(Some("10.0.0.2")));
        assert!(!limiter.allow(None));
    }

    #[test]
    fn test_zero_requests_is_invalid() {
        assert!(
            AdmissionRateLimiter::new(0, Duration::from_secs(60), RateLimitScope::Global).is_err()
        );
        assert!(AdmissionRateLimiter::new(5, Duration::ZERO, RateLimitScope::Global).is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(RateLimitScope::parse("GLOBAL"), Some(RateLimitScope::Global));
        assert_eq!(RateLimitScope::parse("ip"), Some(RateLimitScope::PerCaller));
        assert_eq!(RateLimitScope::parse("tenant"), None);
    }
}
