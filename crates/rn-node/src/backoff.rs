//! Retry pacing for the registry poll in `Node::wait_for_master`

use std::time::Duration;

use rn_core::config::BackoffConfig;

/// Growing delay between registry attempts, capped at `ceiling`.
///
/// Jitter only ever lengthens a delay: with jitter `j` the wait for a step
/// of `d` lands somewhere in `d..=d * (1 + j)`.
pub struct RegistryBackoff {
    step: Duration,
    ceiling: Duration,
    growth: f64,
    jitter: f64,
    attempts: u32,
}

impl RegistryBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Growth below 1 is raised to 1 and jitter is clamped to `0..=1`.
    pub fn new(initial: Duration, max: Duration, growth: f64, jitter: f64) -> Self {
        Self {
            step: initial.min(max),
            ceiling: max,
            growth: growth.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return how long to wait before the next
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let base = self.step;
        self.step = base.mul_f64(self.growth).min(self.ceiling);

        if self.jitter == 0.0 {
            return base;
        }
        base + base.mul_f64(self.jitter * rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(initial_ms: u64, max_ms: u64) -> RegistryBackoff {
        RegistryBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            2.0,
            0.0,
        )
    }

    #[test]
    fn test_delays_double_until_ceiling() {
        let mut backoff = steady(100, 500);
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_initial_above_ceiling_is_clamped() {
        let mut backoff = steady(5_000, 1_000);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_only_lengthens() {
        let mut backoff =
            RegistryBackoff::new(Duration::from_secs(1), Duration::from_secs(1), 2.0, 0.5);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_shrinking_growth_is_ignored() {
        let mut backoff =
            RegistryBackoff::new(Duration::from_millis(50), Duration::from_secs(1), 0.5, 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }
}
