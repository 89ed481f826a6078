use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::config::ReconnectPolicy;

/// Upper bound (exclusive) of the jitter added to a delay, as a fraction of it.
pub const JITTER_RATIO: f64 = 0.2;

/// Used in place of a random draw when the OS source fails.
const FALLBACK_UNIT: f64 = 0.5;

/// Uniform draw in `[0, 1)` from the OS CSPRNG.
pub fn unit_random() -> f64 {
    let mut buf = [0u8; 8];
    match OsRng.try_fill_bytes(&mut buf) {
        // 53 random bits fill the mantissa exactly.
        Ok(()) => (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => FALLBACK_UNIT,
    }
}

/// Jitter fraction in `[0, JITTER_RATIO)`.
pub fn jitter_fraction() -> f64 {
    JITTER_RATIO * unit_random()
}

pub fn with_jitter(delay: Duration) -> Duration {
    delay + delay.mul_f64(jitter_fraction())
}

/// Exponential backoff driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    delay: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            delay: policy.initial_delay,
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Base delay (without jitter) of the next sleep.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Records a failed attempt and returns how long to sleep before the
    /// next one, or `None` once `max_attempts` attempts have failed.
    pub fn next_sleep(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.policy.max_attempts > 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }
        Some(self.advance())
    }

    /// Called after a session was established and later lost. Restarts the
    /// schedule from `initial_delay` with a zero attempt count; the loss
    /// itself is not a failed attempt.
    pub fn sleep_after_loss(&mut self) -> Duration {
        self.reset();
        self.advance()
    }

    pub fn reset(&mut self) {
        self.delay = self.policy.initial_delay;
        self.attempts = 0;
    }

    /// Jittered current delay; grows the delay for the following sleep.
    fn advance(&mut self) -> Duration {
        let sleep = with_jitter(self.delay);
        let max = self.policy.max_delay.as_secs_f64();
        let next = self.delay.as_secs_f64() * self.policy.backoff_factor;
        self.delay = Duration::from_secs_f64(next.min(max));
        sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_jitter_fraction_distribution() {
        let draws = 10_000;
        let mut sum = 0.0;
        for _ in 0..draws {
            let fraction = jitter_fraction();
            assert!((0.0..JITTER_RATIO).contains(&fraction), "{fraction}");
            sum += fraction;
        }
        let mean = sum / draws as f64;
        assert!((mean - 0.1).abs() < 0.02, "mean {mean}");
    }

    #[test]
    fn test_sleeps_grow_and_cap() {
        let mut backoff = Backoff::new(policy(0));
        for k in 0..8 {
            let base = Duration::from_secs_f64((2f64.powi(k)).min(10.0));
            let sleep = backoff.next_sleep().unwrap();
            assert!(sleep >= base, "sleep {k}: {sleep:?} < {base:?}");
            assert!(sleep < base.mul_f64(1.2), "sleep {k}: {sleep:?}");
        }
        assert_eq!(backoff.current_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_exhaustion_counts_attempts() {
        let mut backoff = Backoff::new(policy(3));
        assert!(backoff.next_sleep().is_some());
        assert!(backoff.next_sleep().is_some());
        assert!(backoff.next_sleep().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = Backoff::new(policy(0));
        backoff.next_sleep();
        backoff.next_sleep();
        assert_eq!(backoff.current_delay(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_loss_does_not_count_as_attempt() {
        let mut backoff = Backoff::new(policy(1));
        let sleep = backoff.sleep_after_loss();
        assert!(sleep >= Duration::from_secs(1) && sleep < Duration::from_millis(1200));
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(2));

        // The first failure after the loss exhausts a one-attempt policy.
        assert!(backoff.next_sleep().is_none());
        assert_eq!(backoff.attempts(), 1);
    }
}
