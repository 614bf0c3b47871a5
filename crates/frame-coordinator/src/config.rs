//! Timeout configuration applied to caller operations.

use std::time::Duration;

/// Page-wide timeout defaults. Each caller operation may override them with
/// an explicit per-call timeout.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    /// Deadline for non-navigating operations.
    pub default_timeout: Duration,
    /// Deadline for operations that wait on a navigation.
    pub default_navigation_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            default_navigation_timeout: Duration::from_millis(30_000),
        }
    }
}

impl TimeoutConfig {
    pub fn operation_timeout(&self, explicit: Option<Duration>) -> Duration {
        explicit.unwrap_or(self.default_timeout)
    }

    pub fn navigation_timeout(&self, explicit: Option<Duration>) -> Duration {
        explicit.unwrap_or(self.default_navigation_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_timeout_wins_over_default() {
        let cfg = TimeoutConfig::default();
        assert_eq!(
            cfg.operation_timeout(Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(cfg.operation_timeout(None), Duration::from_millis(30_000));
        assert_eq!(
            cfg.navigation_timeout(None),
            Duration::from_millis(30_000)
        );
    }
}
