use std::time::Duration;

use rand::Rng;

pub const RANDOM_FACTOR: f64 = 0.5;

/// Exponential backoff with jitter for stream reconnects and storage retries.
///
/// The first attempt after a reset runs immediately; each later attempt waits
/// `base * factor^n`, jittered by up to half the base in either direction and
/// capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            max_delay,
            current_base: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Used after a resource-exhausted error so the next attempt waits the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        let next = base * self.backoff_factor;
        self.current_base = Duration::from_secs_f64(next)
            .clamp(self.initial_delay, self.max_delay.max(self.initial_delay));
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1_000), 1.5, Duration::from_secs(60))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = backoff();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
    }

    #[test]
    fn grows_within_jitter_bounds_and_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = backoff();
        backoff.next_delay_with_rng(&mut rng);
        for _ in 0..30 {
            let base = backoff.current_base().as_secs_f64();
            let delay = backoff.next_delay_with_rng(&mut rng).as_secs_f64();
            assert!(delay >= base * 0.5 - 1e-9 && delay <= base * 1.5 + 1e-9);
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }

    #[test]
    fn reset_to_max_and_reset() {
        let mut backoff = backoff();
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::ZERO);
    }
}
