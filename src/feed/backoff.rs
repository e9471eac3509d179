use rand::Rng;
use tokio::time::Duration;

/// Reconnect backoff: `min(max, base * 2^(attempt-1))`, optionally jittered.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1000, 30_000)
    }
}

impl Backoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: 0.0,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Consecutive failures since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for attempt `n` (1-based), before jitter.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(32) as i32;
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(exp);
        let clamped = base.min(self.max_delay_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Records a failure and returns how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.delay_for_attempt(self.attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        // ±jitter_factor of the delay
        let ms = delay.as_millis() as f64;
        let range = ms * self.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((ms + jitter).max(0.0) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base() {
        let mut b = Backoff::default();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.attempt(), 3);
    }

    #[test]
    fn test_clamped_at_max() {
        let b = Backoff::default();
        assert_eq!(b.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(b.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(b.delay_for_attempt(60), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut b = Backoff::new(1000, 30_000).with_jitter(0.3);
        for _ in 0..20 {
            b.reset();
            let d = b.next_delay().as_millis();
            assert!((700..=1300).contains(&d), "{}", d);
        }
    }
}
