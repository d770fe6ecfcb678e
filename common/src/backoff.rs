use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Doubling reconnect delay, kept within `[first, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    first: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(first: Duration, max: Duration) -> Self {
        let first = first.min(max);
        Self {
            first,
            max,
            current: first,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.first;
    }

    /// Returns the delay to wait before the next attempt and doubles the stored delay.
    pub fn advance(&mut self) -> Duration {
        let used = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        used
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::default();
        let used: Vec<u128> = (0..10).map(|_| backoff.advance().as_millis()).collect();
        assert_eq!(
            used,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000, 60_000]
        );
        assert_eq!(backoff.current(), MAX_BACKOFF);
    }

    #[test]
    fn reset_returns_to_first_delay() {
        let mut backoff = Backoff::default();
        backoff.advance();
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.current(), INITIAL_BACKOFF);
    }

    #[test]
    fn first_is_clamped_to_max() {
        let backoff = Backoff::new(Duration::from_secs(90), Duration::from_secs(60));
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }
}
