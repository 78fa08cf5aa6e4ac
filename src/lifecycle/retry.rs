//! Reopen policy for device disconnections.

use std::time::Duration;

/// How hard to try reopening the stream pair after the device backing it
/// disappears.
///
/// Each disconnection event triggers at most one policy run.  The default is
/// a single immediate attempt; a failed run leaves the effect off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReopenPolicy {
    pub max_attempts: u32,
    /// Delay before each attempt.
    pub backoff: Duration,
}

impl Default for ReopenPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_single_immediate_attempt() {
        let policy = ReopenPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff, Duration::ZERO);
    }
}
