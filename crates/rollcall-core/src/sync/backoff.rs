use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// `delay = min(max_delay, base * 2^attempts) * (1 ± jitter)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter_fraction.clamp(0.0, 0.99),
        }
    }

    /// Un-jittered delay after `attempts` failures.
    pub fn nominal(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        self.delay_with(attempts, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempts);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor)
    }

    /// Range a jittered delay for `attempts` always falls in.
    pub fn bounds(&self, attempts: u32) -> (Duration, Duration) {
        let nominal = self.nominal(attempts);
        (
            nominal.mul_f64(1.0 - self.jitter),
            nominal.mul_f64(1.0 + self.jitter),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_nominal_doubles_then_caps() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|a| backoff.nominal(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.nominal(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_nominal_is_monotonic() {
        let backoff = Backoff::default();
        for attempts in 0..40 {
            assert!(backoff.nominal(attempts) <= backoff.nominal(attempts + 1));
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        for attempts in 0..10 {
            let (low, high) = backoff.bounds(attempts);
            for _ in 0..50 {
                let delay = backoff.delay_with(attempts, &mut rng);
                assert!(delay >= low && delay <= high, "{:?} not in {:?}..={:?}", delay, low, high);
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig {
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            jitter_fraction: 0.1,
            ..SyncConfig::default()
        };
        let backoff = Backoff::from_config(&config);
        assert_eq!(backoff.nominal(1), Duration::from_millis(500));
        assert_eq!(backoff.nominal(5), Duration::from_secs(2));
    }
}
