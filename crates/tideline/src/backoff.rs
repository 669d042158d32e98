use std::time::Duration;

/// Exponential, capped reconnect delay policy. `attempt` is zero-based and
/// counts retries scheduled since the last successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// `None` retries forever; `Some(n)` gives up after `n` scheduled
    /// retries and leaves the session disconnected.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Policy for structured object channels: patient and unbounded, the
    /// mirror should come back whenever the server does.
    pub fn structured() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(8000),
            max_attempts: None,
        }
    }

    /// Policy for interactive terminal tabs: faster first retry, but a dead
    /// tab stops hammering the server after six attempts.
    pub fn terminal() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_millis(8000),
            max_attempts: Some(6),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^attempt saturates well past any sane cap.
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}
