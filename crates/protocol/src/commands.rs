use serde::{Deserialize, Serialize};

use crate::constants::MAX_VOLUME;
use crate::types::{Capability, DeviceId};

/// Swipe direction on the touch surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Repeat mode of the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Off,
    Track,
    All,
}

/// Abstract remote-control command understood by every device.
///
/// Serialized as `{"command": "...", "params": ...}` so the same value can
/// travel over the protocol helper link unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum RemoteCommand {
    // Power
    PowerOn,
    PowerOff,
    PowerToggle,

    // Navigation
    CursorUp,
    CursorDown,
    CursorLeft,
    CursorRight,
    Select,
    Back,
    Home,
    TopMenu,
    ContextMenu,
    ControlCenter,
    AppSwitcher,
    Guide,
    Screensaver,

    Swipe(SwipeDirection),

    // Transport
    PlayPause,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    FastForward,
    Rewind,
    SkipForward,
    SkipBackward,
    /// Absolute position in seconds.
    Seek(u32),
    Repeat(RepeatMode),
    Shuffle(bool),
    ChannelUp,
    ChannelDown,

    // Volume
    VolumeUp,
    VolumeDown,
    SetVolume(u8),
    MuteToggle,

    /// Launch an app by identifier or display name.
    LaunchApp(String),

    /// Route audio to the given output devices.
    SetOutputDevices(Vec<DeviceId>),
}

impl RemoteCommand {
    /// The capability a device must declare to accept this command.
    pub fn required_capability(&self) -> Capability {
        use RemoteCommand::*;
        match self {
            PowerOn | PowerOff | PowerToggle => Capability::Power,
            CursorUp | CursorDown | CursorLeft | CursorRight | Select | Back | Home | TopMenu
            | ContextMenu | ControlCenter | AppSwitcher | Guide | Screensaver => {
                Capability::Navigation
            }
            Swipe(_) => Capability::Touch,
            PlayPause | Play | Pause | Stop | Next | Previous | FastForward | Rewind
            | SkipForward | SkipBackward | Repeat(_) | Shuffle(_) | ChannelUp | ChannelDown => {
                Capability::Transport
            }
            Seek(_) => Capability::Seek,
            VolumeUp | VolumeDown | SetVolume(_) | MuteToggle => Capability::Volume,
            LaunchApp(_) => Capability::AppLaunch,
            SetOutputDevices(_) => Capability::OutputRouting,
        }
    }

    /// Returns true for the commands that change power state.
    pub fn is_power(&self) -> bool {
        matches!(
            self,
            RemoteCommand::PowerOn | RemoteCommand::PowerOff | RemoteCommand::PowerToggle
        )
    }

    /// Returns true for power-on, which may be queued before a session connects.
    pub fn is_power_on(&self) -> bool {
        matches!(self, RemoteCommand::PowerOn)
    }

    /// Checks parameter ranges. Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RemoteCommand::SetVolume(level) if *level > MAX_VOLUME => {
                Err(format!("volume {level} exceeds {MAX_VOLUME}"))
            }
            RemoteCommand::LaunchApp(app) if app.trim().is_empty() => {
                Err("app name is empty".into())
            }
            _ => Ok(()),
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        use RemoteCommand::*;
        match self {
            PowerOn => "power_on",
            PowerOff => "power_off",
            PowerToggle => "power_toggle",
            CursorUp => "cursor_up",
            CursorDown => "cursor_down",
            CursorLeft => "cursor_left",
            CursorRight => "cursor_right",
            Select => "select",
            Back => "back",
            Home => "home",
            TopMenu => "top_menu",
            ContextMenu => "context_menu",
            ControlCenter => "control_center",
            AppSwitcher => "app_switcher",
            Guide => "guide",
            Screensaver => "screensaver",
            Swipe(_) => "swipe",
            PlayPause => "play_pause",
            Play => "play",
            Pause => "pause",
            Stop => "stop",
            Next => "next",
            Previous => "previous",
            FastForward => "fast_forward",
            Rewind => "rewind",
            SkipForward => "skip_forward",
            SkipBackward => "skip_backward",
            Seek(_) => "seek",
            Repeat(_) => "repeat",
            Shuffle(_) => "shuffle",
            ChannelUp => "channel_up",
            ChannelDown => "channel_down",
            VolumeUp => "volume_up",
            VolumeDown => "volume_down",
            SetVolume(_) => "set_volume",
            MuteToggle => "mute_toggle",
            LaunchApp(_) => "launch_app",
            SetOutputDevices(_) => "set_output_devices",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_command_wire_shape() {
        let json = serde_json::to_string(&RemoteCommand::PlayPause).unwrap();
        assert_eq!(json, r#"{"command":"play_pause"}"#);
    }

    #[test]
    fn parameterized_command_wire_shape() {
        let json = serde_json::to_string(&RemoteCommand::SetVolume(40)).unwrap();
        assert_eq!(json, r#"{"command":"set_volume","params":40}"#);

        let parsed: RemoteCommand =
            serde_json::from_str(r#"{"command":"swipe","params":"left"}"#).unwrap();
        assert_eq!(parsed, RemoteCommand::Swipe(SwipeDirection::Left));
    }

    #[test]
    fn capability_mapping() {
        assert_eq!(
            RemoteCommand::PowerToggle.required_capability(),
            Capability::Power
        );
        assert_eq!(RemoteCommand::Seek(10).required_capability(), Capability::Seek);
        assert_eq!(
            RemoteCommand::SetOutputDevices(vec![]).required_capability(),
            Capability::OutputRouting
        );
        assert_eq!(
            RemoteCommand::Swipe(SwipeDirection::Up).required_capability(),
            Capability::Touch
        );
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(RemoteCommand::SetVolume(100).validate().is_ok());
        assert!(RemoteCommand::SetVolume(101).validate().is_err());
        assert!(RemoteCommand::LaunchApp("  ".into()).validate().is_err());
        assert!(RemoteCommand::LaunchApp("Netflix".into()).validate().is_ok());
    }

    #[test]
    fn power_predicates() {
        assert!(RemoteCommand::PowerOn.is_power_on());
        assert!(RemoteCommand::PowerOff.is_power());
        assert!(!RemoteCommand::PowerOff.is_power_on());
        assert!(!RemoteCommand::Home.is_power());
    }
}
