//! Delay between reconnect attempts.

use std::time::Duration;

/// Decides how long to wait before reconnect attempt `attempt` (1-based).
///
/// Returning `None` reconnects immediately.
pub trait ReconnectPolicy: Send {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Called after a connection reached the live state.
    fn reset(&mut self) {}
}

/// Reconnect without waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl ReconnectPolicy for Immediate {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Doubling delay, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        Some(delay.min(self.max_delay))
    }
}
