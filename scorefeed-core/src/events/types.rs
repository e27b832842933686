//! Change-event types and the fixed channel set.

use serde_json::Value;

/// A named category of change event used for routing.
///
/// The set is fixed and known ahead of time; it mirrors the NOTIFY
/// channels the source store emits on. Not extensible at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Aggregated match data changed.
    MatchData,
    /// Match record changed.
    Match,
    /// Scoreboard state changed.
    Scoreboard,
    /// Play clock changed.
    Playclock,
    /// Game clock changed.
    Gameclock,
    /// A football event (play) was recorded or edited.
    FootballEvent,
    /// A player's per-match record changed.
    PlayerMatch,
}

impl Channel {
    /// Every channel the pipeline subscribes to, in registration order.
    pub const ALL: [Channel; 7] = [
        Channel::MatchData,
        Channel::Match,
        Channel::Scoreboard,
        Channel::Playclock,
        Channel::Gameclock,
        Channel::FootballEvent,
        Channel::PlayerMatch,
    ];

    /// The wire name of this channel, as used by the source store's
    /// NOTIFY and inside relay envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::MatchData => "matchdata_change",
            Channel::Match => "match_change",
            Channel::Scoreboard => "scoreboard_change",
            Channel::Playclock => "playclock_change",
            Channel::Gameclock => "gameclock_change",
            Channel::FootballEvent => "football_event_change",
            Channel::PlayerMatch => "player_match_change",
        }
    }

    /// Resolve a wire name back to a channel. Unknown names yield `None`;
    /// callers log and skip rather than fail.
    pub fn parse(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed change at the source store.
///
/// The payload is whatever the producer serialized; this subsystem treats
/// it as opaque and only routes on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The channel the change was emitted on.
    pub channel: Channel,
    /// The producer's JSON payload, not validated beyond being JSON.
    pub payload: Value,
}

impl ChangeEvent {
    pub fn new(channel: Channel, payload: Value) -> Self {
        Self { channel, payload }
    }
}
