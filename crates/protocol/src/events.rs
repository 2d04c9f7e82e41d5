use serde::{Deserialize, Serialize};

use crate::types::{AppInfo, CapabilitySet, DeviceId, PlaybackInfo, PowerState};

/// Unsolicited event pushed by a live device connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    PowerStateChanged(PowerState),
    /// The device or the link dropped the connection.
    ConnectionLost(String),
    CapabilitiesChanged(CapabilitySet),
    PlaybackUpdated(PlaybackInfo),
    VolumeChanged(u8),
    AppListChanged(Vec<AppInfo>),
    OutputDevicesChanged(Vec<DeviceId>),
    /// Screensaver started or stopped. Not every firmware reports it.
    ScreensaverChanged(bool),
}
