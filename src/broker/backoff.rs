//! Reconnect delay schedule for the pub/sub pump.

use std::time::Duration;

use rand::Rng;

/// Fractional jitter applied to every delay.
const JITTER: f64 = 0.1;

/// Doubling delay with a cap and +/-10% jitter.
///
/// Starts at the configured initial delay and doubles on each call to
/// [`next_delay`](Self::next_delay) until the cap; `reset` restarts the
/// schedule after a successful connection.
pub struct ReconnectBackoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            current_ms: initial_ms.min(max_ms),
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let base_ms = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);

        let spread = base_ms as f64 * JITTER;
        let delay_ms = if spread >= 1.0 {
            let offset = rand::rng().random_range(-spread..spread);
            (base_ms as f64 + offset).max(1.0) as u64
        } else {
            base_ms.max(1)
        };

        Duration::from_millis(delay_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms.min(self.max_ms);
        self.attempt = 0;
    }

    /// Attempts taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
