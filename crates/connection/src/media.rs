//! Hub-facing player state.

use atvlink_protocol::{PlaybackInfo, PlaybackState, PowerState};
use serde::{Deserialize, Serialize};

use crate::types::SessionState;

/// Player state reported to the hub for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    #[default]
    Unavailable,
    Standby,
    Off,
    On,
    Playing,
    Paused,
}

/// Derives the player state from session state, power and playback.
pub fn player_state(
    session: SessionState,
    power: PowerState,
    playback: Option<&PlaybackInfo>,
) -> PlayerState {
    if session != SessionState::Connected {
        return PlayerState::Unavailable;
    }
    match power {
        PowerState::Unknown => PlayerState::Standby,
        PowerState::Standby => PlayerState::Off,
        PowerState::On => match playback.map(|p| p.state) {
            Some(PlaybackState::Playing | PlaybackState::Seeking) => PlayerState::Playing,
            Some(PlaybackState::Paused) => PlayerState::Paused,
            _ => PlayerState::On,
        },
    }
}
