//! Shard lifecycle states

use std::fmt;

/// Lifecycle state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardStatus {
    /// No socket; initial and terminal state
    Idle,
    /// Opening a socket
    Connecting,
    /// Socket open, identify pending
    Identifying,
    /// Socket open, resume pending
    Resuming,
    /// Session is live
    Running,
    /// Session is live and the initial guild backlog has drained
    GuildsReady,
    /// Socket closed; a retry or a manual call follows
    Disconnected,
}

impl ShardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Identifying => "IDENTIFYING",
            Self::Resuming => "RESUMING",
            Self::Running => "RUNNING",
            Self::GuildsReady => "GUILDS_READY",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// Live sessions transmit sends immediately instead of queueing them.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::GuildsReady)
    }

    /// States a fresh socket lifecycle may start from.
    pub fn is_detached(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// States in which heartbeats are sent.
    pub(crate) fn heartbeats(self) -> bool {
        matches!(
            self,
            Self::Identifying | Self::Resuming | Self::Running | Self::GuildsReady
        )
    }

    /// Numeric value for the state gauge
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Identifying => 2.0,
            Self::Resuming => 3.0,
            Self::Running => 4.0,
            Self::GuildsReady => 5.0,
            Self::Disconnected => 6.0,
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_states_are_live() {
        assert!(ShardStatus::Running.is_live());
        assert!(ShardStatus::GuildsReady.is_live());
        for status in [
            ShardStatus::Idle,
            ShardStatus::Connecting,
            ShardStatus::Identifying,
            ShardStatus::Resuming,
            ShardStatus::Disconnected,
        ] {
            assert!(!status.is_live(), "{status} should not be live");
        }
    }

    #[test]
    fn detached_states() {
        assert!(ShardStatus::Idle.is_detached());
        assert!(ShardStatus::Disconnected.is_detached());
        assert!(!ShardStatus::Running.is_detached());
        assert!(!ShardStatus::Connecting.is_detached());
    }
}
