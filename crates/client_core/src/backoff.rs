use std::time::Duration;

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// `delay = min(base * 2^attempt, cap)`; at most `max_attempts` reconnects
/// are scheduled between successful opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            cap: DEFAULT_RECONNECT_CAP,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms).min(self.cap)
    }

    pub fn allows_retry(&self, scheduled: u32) -> bool {
        scheduled < self.max_attempts
    }
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
