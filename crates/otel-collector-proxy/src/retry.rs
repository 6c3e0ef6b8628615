// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use std::time::Duration;

/// How often and how patiently a batch is retried after a retryable failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total delivery attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Random extra delay, as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// True once `attempts` deliveries have been tried and no more are allowed.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Backoff after the given number of failed attempts: `base * 2^(attempts - 1)`, capped at
    /// `max_delay`. A backend supplied `Retry-After` is honoured when it lies between the
    /// computed delay and the cap.
    pub fn backoff(&self, attempts: u32, preferred: Option<Duration>) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let candidate = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        match preferred {
            Some(preferred) if candidate <= preferred && preferred <= self.max_delay => preferred,
            _ => candidate,
        }
    }

    /// [`RetryPolicy::backoff`] plus uniform jitter in `[0, jitter_ratio * delay]`.
    pub fn delay_with_jitter<R: Rng>(
        &self,
        attempts: u32,
        preferred: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let delay = self.backoff(attempts, preferred);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = delay.mul_f64(self.jitter_ratio * rng.gen_range(0.0..=1.0));
        delay + jitter
    }
}
