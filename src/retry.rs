use std::time::Duration;

/// Delay schedule between reconnection attempts.
///
/// With `base == max` this is a fixed delay; otherwise the delay doubles on
/// every attempt up to `max`. Attempts are unbounded, the caller stops
/// retrying when it is told to shut down.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Backoff { base, max, next: base, attempts: 0 }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempts = self.attempts.saturating_add(1);
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempts = 0;
    }
}
