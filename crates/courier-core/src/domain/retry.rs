//! Retry policy: decides backoff delays.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff with a cap and bounded jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of any delay, jitter included.
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay, in `[0, 1]`.
    /// A delay `d` becomes a value in `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,

    /// Seed for the jitter source. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl RetryPolicy {
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            seed: None,
        }
    }

    /// Deterministic policy without jitter.
    pub fn fixed_exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
            seed: None,
        }
    }

    /// Delay before retry number `retry_count` (1-indexed), without jitter.
    ///
    /// delay = min(base_delay * multiplier^(retry_count - 1), max_delay)
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay with jitter drawn from `rng`, still capped at `max_delay`.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(retry_count);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        let secs = (nominal.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// A `RetryPolicy` plus its jitter source, shareable across tasks.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            policy,
            rng: Mutex::new(rng),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.policy.delay_with(retry_count, &mut *rng)
    }
}
