use std::time::Duration;

/// Reconnect delay applied by the long-running consumers.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);

/// How long to wait before reconnecting after a connection-level failure.
///
/// Returning `None` from [`RetryPolicy::delay_for`] means give up. Neither
/// variant ever does: the consumers are long-lived services and keep trying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay before every attempt.
    FixedDelay(Duration),
    /// Doubling delay from `base`, capped at `max`.
    Backoff { base: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::FixedDelay(DEFAULT_RECONNECT_DELAY)
    }
}

impl RetryPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::FixedDelay(delay) => Some(delay),
            RetryPolicy::Backoff { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent);
                Some(delay.min(max))
            }
        }
    }
}
