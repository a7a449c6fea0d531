//! Exponential backoff with jitter and provider rotation, as a plain value threaded
//! through a retry loop.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Fraction of the delay added or removed at random (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), jittered and capped at `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exp);
        let base_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        let cap_ms = self.max_delay.as_millis() as u64;
        let base_ms = base_ms.min(cap_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let ms = if jitter > 0.0 && base_ms > 0 {
            let spread = base_ms as f64 * jitter;
            (base_ms as f64 + rng.gen_range(-spread..=spread)).max(0.0) as u64
        } else {
            base_ms
        };
        Duration::from_millis(ms.min(cap_ms))
    }
}

/// Retry bookkeeping for one call: attempts, consecutive failures, current delay and
/// which provider to use next.
#[derive(Clone, Debug)]
pub struct RetryState {
    attempts: u32,
    consecutive_errors: u32,
    provider: usize,
    providers: usize,
    current_delay: Duration,
}

impl RetryState {
    pub fn new(providers: usize) -> Self {
        Self {
            attempts: 0,
            consecutive_errors: 0,
            provider: 0,
            providers: providers.max(1),
            current_delay: Duration::ZERO,
        }
    }

    pub fn provider(&self) -> usize {
        self.provider
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn record_success(&mut self) {
        self.attempts += 1;
        self.consecutive_errors = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Count a failure and rotate to the next provider. Returns the delay to wait when
    /// the failure is retryable, `None` when the next provider should be tried at once.
    pub fn record_failure<R: Rng + ?Sized>(
        &mut self,
        policy: &BackoffPolicy,
        retryable: bool,
        rng: &mut R,
    ) -> Option<Duration> {
        self.attempts += 1;
        self.consecutive_errors += 1;
        self.provider = (self.provider + 1) % self.providers;
        if retryable {
            self.current_delay = policy.delay_for(self.consecutive_errors, rng);
            Some(self.current_delay)
        } else {
            self.current_delay = Duration::ZERO;
            None
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
