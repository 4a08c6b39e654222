//! # Reconnect Backoff
//!
//! Delay schedule for the reconnect loop: exponential growth from a base
//! delay, capped at a maximum, with an optional limit on the number of
//! attempts.
//!
//! ```rust
//! use editor_bridge::backoff::Backoff;
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350), 4);
//! let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
//!
//! assert_eq!(
//!     delays,
//!     vec![
//!         Duration::ZERO,
//!         Duration::from_millis(100),
//!         Duration::from_millis(200),
//!         Duration::from_millis(350),
//!     ]
//! );
//! ```

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential backoff state for one reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_delay: Duration,
    /// 0 means unlimited.
    max_attempts: u32,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_delay,
            max_attempts,
            attempt: 0,
            delay: base_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent. The first attempt runs immediately.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt == 1 {
            return Some(Duration::ZERO);
        }
        let current = std::cmp::min(self.delay, self.max_delay);
        self.delay = std::cmp::min(self.delay.saturating_mul(2), self.max_delay);
        Some(current)
    }

    /// Number of attempts handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }
}
