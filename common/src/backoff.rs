use std::time::Duration;

// Bounded exponential backoff for transport reconnects. `None` from
// `next_delay` means the attempt budget is spent; callers decide whether to
// reset and keep trying or to restart the device.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exponent = self.attempt.min(16);
        let delay = self
            .initial
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30), 8);

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|delay| delay.as_secs())
            .collect();

        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30, 30]);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), 64);

        let mut last = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_secs(300));
            assert!(delay >= last.min(Duration::from_secs(300)));
            last = delay;
        }
        assert_eq!(backoff.attempt(), 64);
    }
}
