//! Per-Connection Settings
//!
//! Every accepted connection receives a copy of [`ConnectionSettings`] from
//! the manager's settings template at start time. Settings are a pure value:
//! no identity, immutable once constructed, cheap to copy.

use std::fmt;
use std::time::Duration;

/// Immutable per-connection configuration.
///
/// Currently this is just the inactivity timeout: the longest a connection
/// may sit without receiving a complete line before it is closed. A zero
/// duration disables the timeout entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionSettings {
    inactivity_timeout: Duration,
}

impl ConnectionSettings {
    /// Creates settings with the given inactivity timeout.
    ///
    /// `Duration::ZERO` means "never time out".
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self { inactivity_timeout }
    }

    /// Returns the inactivity timeout.
    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Whether the idle timer should be armed at all.
    pub fn should_timeout(&self) -> bool {
        self.inactivity_timeout > Duration::ZERO
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.should_timeout() {
            write!(f, "inactivity_timeout={}ms", self.inactivity_timeout.as_millis())
        } else {
            write!(f, "inactivity_timeout=disabled")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_disabled() {
        let settings = ConnectionSettings::new(Duration::ZERO);
        assert!(!settings.should_timeout());
        assert_eq!(settings.inactivity_timeout(), Duration::ZERO);
    }

    #[test]
    fn positive_timeout_is_enabled() {
        let settings = ConnectionSettings::new(Duration::from_millis(100));
        assert!(settings.should_timeout());
        assert_eq!(settings.inactivity_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn default_is_disabled() {
        assert!(!ConnectionSettings::default().should_timeout());
    }

    #[test]
    fn display_shows_timeout() {
        let enabled = ConnectionSettings::new(Duration::from_secs(3));
        assert_eq!(enabled.to_string(), "inactivity_timeout=3000ms");
        assert_eq!(
            ConnectionSettings::default().to_string(),
            "inactivity_timeout=disabled"
        );
    }
}
