//! Initial guild backlog tracking

use super::timer::Timer;
use std::collections::HashSet;
use twilight_model::id::marker::GuildMarker;
use twilight_model::id::Id;

/// Guilds announced by READY that have not been delivered yet.
#[derive(Debug, Default)]
pub(crate) struct GuildSync {
    expected: Option<HashSet<Id<GuildMarker>>>,
    pub(crate) timer: Timer,
}

impl GuildSync {
    pub(crate) fn begin(&mut self, guilds: impl IntoIterator<Item = Id<GuildMarker>>) {
        self.expected = Some(guilds.into_iter().collect());
    }

    pub(crate) fn is_tracking(&self) -> bool {
        self.expected.is_some()
    }

    /// Mark a guild as delivered. Returns true if it was being tracked.
    pub(crate) fn arrived(&mut self, guild_id: Id<GuildMarker>) -> bool {
        self.expected
            .as_mut()
            .is_some_and(|expected| expected.remove(&guild_id))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.expected.as_ref().map_or(0, HashSet::len)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn reset(&mut self) {
        self.timer.cancel();
        self.expected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_every_guild_arrives() {
        let mut sync = GuildSync::default();
        assert!(!sync.is_tracking());

        sync.begin([Id::new(1), Id::new(2)]);
        assert!(sync.is_tracking());
        assert_eq!(sync.remaining(), 2);

        assert!(sync.arrived(Id::new(1)));
        assert!(!sync.arrived(Id::new(1)));
        assert!(!sync.arrived(Id::new(99)));
        assert!(!sync.is_complete());

        assert!(sync.arrived(Id::new(2)));
        assert!(sync.is_complete());
    }

    #[test]
    fn empty_backlog_is_complete() {
        let mut sync = GuildSync::default();
        sync.begin(std::iter::empty());
        assert!(sync.is_complete());
    }

    #[test]
    fn reset_stops_tracking() {
        let mut sync = GuildSync::default();
        sync.begin([Id::new(5)]);
        sync.reset();
        assert!(!sync.is_tracking());
        assert!(!sync.arrived(Id::new(5)));
    }
}
