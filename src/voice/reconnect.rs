//! Reconnect policy for the transcription transport

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Bounded exponential backoff
///
/// `attempt` resets to 0 when a connection opens and increments on every
/// abnormal close. The delay before reconnect `n` is
/// `min(base_delay * 2^n, max_delay)`; once `max_attempts` reconnects have
/// been scheduled without an intervening open, the next abnormal close is
/// fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts used
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Reconnects scheduled since the last successful open
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Connection opened; start counting from zero again
    pub const fn on_open(&mut self) {
        self.attempt = 0;
    }

    /// Record an abnormal close
    ///
    /// Returns the delay before the next attempt, or `None` when attempts
    /// are exhausted.
    pub fn on_abnormal_close(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    /// Backoff delay for a given attempt number
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
