//! Public types for the session core.

use std::fmt;
use std::time::Duration;

use atvlink_protocol::constants::{
    COMMAND_TIMEOUT, CONNECT_TIMEOUT, DISCOVERY_TIMEOUT, MAX_PIN_ATTEMPTS, PIN_TIMEOUT,
    POWER_ON_CONNECT_TIMEOUT, TIMEOUTS_BEFORE_RECONNECT, WAKE_GRACE,
};
use atvlink_protocol::{
    AppInfo, CapabilitySet, DeviceId, PlaybackInfo, PowerState, ProtocolKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::command::CorrelationId;
use crate::device::DeviceRecord;
use crate::error::DriverError;
use crate::media::PlayerState;
use crate::reconnection::ReconnectConfig;

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Discovering,
    Pairing,
    Connecting,
    Connected,
    Reconnecting,
    /// Needs user action (re-pairing) before it leaves this state.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Discovering => "discovering",
            SessionState::Pairing => "pairing",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Step of an in-progress pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PairingStep {
    Started { protocol: ProtocolKind },
    /// The device shows a PIN and waits for the user to submit it.
    AwaitingUserPin {
        protocol: ProtocolKind,
        attempts_left: u32,
    },
    Verifying { protocol: ProtocolKind },
    Succeeded,
    Failed { reason: String },
}

/// Answer to a submitted pairing PIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinOutcome {
    /// Every protocol is paired; the session moves on to connecting.
    Paired,
    /// PIN accepted; the next protocol now waits for its own PIN.
    NextProtocol(ProtocolKind),
    /// PIN rejected; the same protocol waits for another try.
    Retry { attempts_left: u32 },
}

/// Pairing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingSettings {
    /// Protocols to pair, in order. Only those the device offers are used.
    pub protocols: Vec<ProtocolKind>,
    pub max_pin_attempts: u32,
    /// How long a step waits for the user.
    pub pin_timeout: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            protocols: vec![ProtocolKind::AirPlay, ProtocolKind::Companion],
            max_pin_attempts: MAX_PIN_ATTEMPTS,
            pin_timeout: PIN_TIMEOUT,
        }
    }
}

/// Tunable thresholds of the session core.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub reconnect: ReconnectConfig,
    pub command_timeout: Duration,
    /// Consecutive command timeouts that force a reconnect.
    pub timeouts_before_reconnect: u32,
    pub wake_grace: Duration,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Failed connects after which the address is looked up again.
    pub rediscover_after: u32,
    /// How long a power-on queued before connecting waits for the session.
    pub power_on_connect_timeout: Duration,
    pub pairing: PairingSettings,
    pub sound_output_enabled: bool,
    pub event_capacity: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            command_timeout: COMMAND_TIMEOUT,
            timeouts_before_reconnect: TIMEOUTS_BEFORE_RECONNECT,
            wake_grace: WAKE_GRACE,
            connect_timeout: CONNECT_TIMEOUT,
            discovery_timeout: DISCOVERY_TIMEOUT,
            rediscover_after: 3,
            power_on_connect_timeout: POWER_ON_CONNECT_TIMEOUT,
            pairing: PairingSettings::default(),
            sound_output_enabled: true,
            event_capacity: 256,
        }
    }
}

/// Consistent status view of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device: DeviceRecord,
    pub state: SessionState,
    pub enabled: bool,
    pub power: PowerState,
    pub player: PlayerState,
    pub playback: Option<PlaybackInfo>,
    pub volume: Option<u8>,
    /// Consecutive failed attempts while reconnecting.
    pub retry_attempt: u32,
    pub pairing: Option<PairingStep>,
    pub queue_depth: usize,
    pub last_error: Option<String>,
}

impl DeviceSnapshot {
    pub(crate) fn initial(device: DeviceRecord) -> Self {
        Self {
            device,
            state: SessionState::Disconnected,
            enabled: false,
            power: PowerState::Unknown,
            player: PlayerState::Unavailable,
            playback: None,
            volume: None,
            retry_attempt: 0,
            pairing: None,
            queue_depth: 0,
            last_error: None,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.device.capabilities
    }
}

/// Events published by the registry. Per-device order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    StateChanged {
        device: DeviceId,
        state: SessionState,
    },
    Reconnecting {
        device: DeviceId,
        attempt: u32,
        next_retry: Duration,
    },
    CommandCompleted {
        device: DeviceId,
        correlation: CorrelationId,
        command: &'static str,
        result: Result<(), DriverError>,
    },
    CapabilitiesUpdated {
        device: DeviceId,
        capabilities: CapabilitySet,
    },
    PowerChanged {
        device: DeviceId,
        power: PowerState,
        player: PlayerState,
    },
    Playback {
        device: DeviceId,
        playback: Option<PlaybackInfo>,
        player: PlayerState,
    },
    VolumeChanged {
        device: DeviceId,
        level: u8,
    },
    AppListChanged {
        device: DeviceId,
        apps: Vec<AppInfo>,
    },
    OutputsChanged {
        device: DeviceId,
        outputs: Vec<DeviceId>,
    },
    PairingStep {
        device: DeviceId,
        step: PairingStep,
    },
    /// Host-generated PIN the user must type on the device.
    PairingPin {
        device: DeviceId,
        protocol: ProtocolKind,
        pin: String,
    },
    DeviceUpdated {
        device: DeviceRecord,
    },
}

/// Non-blocking publisher of driver events.
///
/// A slow consumer never stalls a session; events are dropped with a
/// warning when the channel is full.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DriverEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DriverEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: DriverEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "driver event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
