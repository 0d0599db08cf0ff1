//! Heartbeat bookkeeping
//!
//! Tracks the jitter window before the first beat, whether the last beat is
//! still awaiting its ACK, and the round-trip estimate. The timer task itself
//! is driven by the session; this type only holds the state it consults.

use super::timer::Timer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

static JITTER_STAMPS: AtomicU64 = AtomicU64::new(1);

/// Result of a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Send a heartbeat now
    Beat,
    /// The previous beat was never acknowledged
    Zombie,
}

#[derive(Debug, Default)]
pub(crate) struct Heartbeat {
    waiting_since: Option<Instant>,
    jitter: Option<u64>,
    ping: Duration,
    pub(crate) timer: Timer,
}

impl Heartbeat {
    /// Open a jitter window, invalidating any earlier one.
    pub(crate) fn arm_jitter(&mut self) -> u64 {
        let stamp = JITTER_STAMPS.fetch_add(1, Ordering::Relaxed);
        self.jitter = Some(stamp);
        stamp
    }

    /// Close the jitter window if `stamp` is still the current one.
    pub(crate) fn take_jitter(&mut self, stamp: u64) -> bool {
        if self.jitter == Some(stamp) {
            self.jitter = None;
            true
        } else {
            false
        }
    }

    /// Decide what a tick does. Forced ticks answer heartbeat requests and
    /// skip the ACK check.
    pub(crate) fn tick(&self, force: bool) -> Tick {
        if self.waiting_since.is_some() && !force {
            Tick::Zombie
        } else {
            Tick::Beat
        }
    }

    /// Record that a beat was handed to the socket.
    pub(crate) fn sent(&mut self, now: Instant) {
        self.waiting_since = Some(now);
    }

    /// Record an ACK; returns the new ping when a beat was outstanding.
    pub(crate) fn ack(&mut self, now: Instant) -> Option<Duration> {
        let since = self.waiting_since.take()?;
        self.ping = now.saturating_duration_since(since);
        Some(self.ping)
    }

    pub(crate) fn ping(&self) -> Duration {
        self.ping
    }

    /// Drop everything tied to the current socket.
    pub(crate) fn reset(&mut self) {
        self.timer.cancel();
        self.jitter = None;
        self.waiting_since = None;
        self.ping = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_beat_makes_next_tick_zombie() {
        let mut hb = Heartbeat::default();
        assert_eq!(hb.tick(false), Tick::Beat);

        hb.sent(Instant::now());
        assert_eq!(hb.tick(false), Tick::Zombie);
        assert_eq!(hb.tick(true), Tick::Beat);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_measures_round_trip() {
        let mut hb = Heartbeat::default();
        assert!(hb.ack(Instant::now()).is_none());

        hb.sent(Instant::now());
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(hb.ack(Instant::now()), Some(Duration::from_millis(40)));
        assert_eq!(hb.ping(), Duration::from_millis(40));
        assert_eq!(hb.tick(false), Tick::Beat);
    }

    #[test]
    fn stale_jitter_stamp_is_rejected() {
        let mut hb = Heartbeat::default();
        let first = hb.arm_jitter();
        let second = hb.arm_jitter();

        assert!(!hb.take_jitter(first));
        assert!(hb.take_jitter(second));
        assert!(!hb.take_jitter(second));
    }

    #[test]
    fn reset_clears_state() {
        let mut hb = Heartbeat::default();
        let stamp = hb.arm_jitter();
        hb.reset();
        assert!(!hb.take_jitter(stamp));
        assert_eq!(hb.ping(), Duration::ZERO);
    }
}
