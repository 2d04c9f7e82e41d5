use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Stable identifier of a media device.
///
/// Usually the AirPlay `deviceid` (MAC-derived) or the MediaRemote unique
/// identifier, so it survives DHCP address changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device protocols that can carry a pairing credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    AirPlay,
    Companion,
    MediaRemote,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::AirPlay => write!(f, "airplay"),
            ProtocolKind::Companion => write!(f, "companion"),
            ProtocolKind::MediaRemote => write!(f, "mediaremote"),
        }
    }
}

/// A named feature a specific device instance is known to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Power,
    Navigation,
    Touch,
    Transport,
    Seek,
    Volume,
    AppLaunch,
    OutputRouting,
    AudioSink,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Power => "power",
            Capability::Navigation => "navigation",
            Capability::Touch => "touch",
            Capability::Transport => "transport",
            Capability::Seek => "seek",
            Capability::Volume => "volume",
            Capability::AppLaunch => "app_launch",
            Capability::OutputRouting => "output_routing",
            Capability::AudioSink => "audio_sink",
        };
        f.write_str(s)
    }
}

/// Set of capabilities, ordered for stable serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known capability.
    pub fn all() -> Self {
        [
            Capability::Power,
            Capability::Navigation,
            Capability::Touch,
            Capability::Transport,
            Capability::Seek,
            Capability::Volume,
            Capability::AppLaunch,
            Capability::OutputRouting,
            Capability::AudioSink,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Power state as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    Unknown,
    On,
    Standby,
}

impl PowerState {
    pub fn is_standby(self) -> bool {
        self == PowerState::Standby
    }

    pub fn is_active(self) -> bool {
        self == PowerState::On
    }
}

/// What the device's player is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    Seeking,
}

/// Kind of media currently loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Unknown,
    Music,
    Video,
    Tv,
}

/// Now-playing information pushed by the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub state: PlaybackState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default)]
    pub media_kind: MediaKind,
    /// Position in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// Total duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<u32>,
}

/// An installed application on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub identifier: String,
}

/// One advertised protocol endpoint of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub protocol: ProtocolKind,
    pub port: u16,
}

/// A candidate device as seen by discovery (or rebuilt from a stored record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// Other identifiers the device is known by (MAC, MRP id, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            aliases: Vec::new(),
            services: Vec::new(),
            model: None,
            capabilities: CapabilitySet::new(),
        }
    }

    /// Returns true if this candidate is the device known as `id`.
    pub fn matches(&self, id: &DeviceId) -> bool {
        &self.id == id || self.aliases.iter().any(|a| a == id.as_str())
    }

    /// Returns true if the device advertises `protocol`.
    pub fn offers(&self, protocol: ProtocolKind) -> bool {
        self.services.iter().any(|s| s.protocol == protocol)
    }
}

/// Secret obtained by pairing one protocol.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCredential {
    pub protocol: ProtocolKind,
    pub secret: String,
}

impl fmt::Debug for ProtocolCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCredential")
            .field("protocol", &self.protocol)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Opaque pairing credential of a device, one secret per paired protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(Vec<ProtocolCredential>);

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the secret for a protocol.
    pub fn insert(&mut self, part: ProtocolCredential) {
        self.0.retain(|p| p.protocol != part.protocol);
        self.0.push(part);
    }

    pub fn get(&self, protocol: ProtocolKind) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.protocol == protocol)
            .map(|p| p.secret.as_str())
    }

    pub fn protocols(&self) -> impl Iterator<Item = ProtocolKind> + '_ {
        self.0.iter().map(|p| p.protocol)
    }

    pub fn parts(&self) -> &[ProtocolCredential] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ProtocolCredential>> for Credential {
    fn from(parts: Vec<ProtocolCredential>) -> Self {
        let mut credential = Credential::new();
        for part in parts {
            credential.insert(part);
        }
        credential
    }
}
