use std::time::Duration;
use time::OffsetDateTime;

/// Exponential backoff schedule for stream reconnects. The policy knows only
/// the attempt count; classifying a disconnect as retryable is the caller's
/// job, and a deliberate cancel never consults the policy at all.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            cap_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReconnectState {
    attempt: u32,
    last_success_at: Option<OffsetDateTime>,
}

impl ReconnectState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_success_at(&self) -> Option<OffsetDateTime> {
        self.last_success_at
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn mark_connected(&mut self) {
        self.attempt = 0;
        self.last_success_at = Some(OffsetDateTime::now_utc());
    }
}

impl ReconnectPolicy {
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is exhausted. Increments `state.attempt` on every call.
    pub fn next_delay(&self, state: &mut ReconnectState) -> Option<Duration> {
        if state.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base_delay
            .checked_mul(1u32.checked_shl(state.attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay);
        state.attempt += 1;
        Some(delay)
    }
}
