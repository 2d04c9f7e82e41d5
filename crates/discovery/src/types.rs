use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use atvlink_protocol::{
    Capability, CapabilitySet, DeviceDescriptor, DeviceId, ProtocolKind, ServiceEndpoint,
};

/// mDNS service type of the MediaRemote protocol.
pub const MEDIAREMOTE_SERVICE: &str = "_mediaremotetv._tcp";

/// mDNS service type of the Companion protocol.
pub const COMPANION_SERVICE: &str = "_companion-link._tcp";

/// mDNS service type of AirPlay.
pub const AIRPLAY_SERVICE: &str = "_airplay._tcp";

/// Service types browsed during a scan, with the protocol each one carries.
pub const BROWSED_SERVICES: [(ProtocolKind, &str); 3] = [
    (ProtocolKind::MediaRemote, MEDIAREMOTE_SERVICE),
    (ProtocolKind::Companion, COMPANION_SERVICE),
    (ProtocolKind::AirPlay, AIRPLAY_SERVICE),
];

/// Model prefix advertised by TV-class devices.
const TV_MODEL_PREFIX: &str = "AppleTV";

/// One resolved mDNS service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub protocol: ProtocolKind,
    /// Instance name without the service suffix, e.g. `Living Room`.
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub ips: Vec<IpAddr>,
    pub properties: HashMap<String, String>,
}

impl ServiceRecord {
    fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// All records seen for one host.
#[derive(Debug, Default)]
struct HostEntry {
    records: BTreeMap<ProtocolKind, ServiceRecord>,
}

impl HostEntry {
    fn first_property(&self, protocol: ProtocolKind, key: &str) -> Option<&str> {
        self.records.get(&protocol).and_then(|r| r.property(key))
    }

    fn model(&self) -> Option<&str> {
        self.first_property(ProtocolKind::AirPlay, "model")
            .or_else(|| self.first_property(ProtocolKind::Companion, "rpMd"))
            .or_else(|| self.first_property(ProtocolKind::MediaRemote, "ModelName"))
    }

    fn is_tv_class(&self) -> bool {
        // MediaRemote is only advertised by TV-class devices.
        if self.records.contains_key(&ProtocolKind::MediaRemote) {
            return true;
        }
        self.model().is_some_and(|m| m.starts_with(TV_MODEL_PREFIX))
    }

    fn descriptor(&self, host: &str) -> DeviceDescriptor {
        let airplay_id = self.first_property(ProtocolKind::AirPlay, "deviceid");
        let unique_id = self.first_property(ProtocolKind::MediaRemote, "UniqueIdentifier");

        let id = airplay_id.or(unique_id).unwrap_or(host);

        let mut aliases: Vec<String> = [airplay_id, unique_id, Some(host)]
            .into_iter()
            .flatten()
            .filter(|a| *a != id)
            .map(str::to_string)
            .collect();
        aliases.dedup();

        let name = self
            .first_property(ProtocolKind::MediaRemote, "Name")
            .map(str::to_string)
            .or_else(|| self.records.values().next().map(|r| r.instance.clone()))
            .unwrap_or_else(|| host.to_string());

        let address = self.records.values().flat_map(|r| r.ips.iter()).next().copied();

        let services = self
            .records
            .values()
            .map(|r| ServiceEndpoint {
                protocol: r.protocol,
                port: r.port,
            })
            .collect::<Vec<_>>();

        let mut descriptor = DeviceDescriptor::new(DeviceId::new(id), name);
        descriptor.address = address;
        descriptor.aliases = aliases;
        descriptor.model = self.model().map(str::to_string);
        descriptor.capabilities = infer_capabilities(&services);
        descriptor.services = services;
        descriptor
    }
}

/// Capabilities a device is expected to have based on the protocols it
/// advertises. Refined after connect from the live session.
pub fn infer_capabilities(services: &[ServiceEndpoint]) -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    for service in services {
        match service.protocol {
            ProtocolKind::MediaRemote => {
                for c in [
                    Capability::Navigation,
                    Capability::Transport,
                    Capability::Seek,
                    Capability::Volume,
                    Capability::Power,
                ] {
                    caps.insert(c);
                }
            }
            ProtocolKind::Companion => {
                for c in [
                    Capability::Navigation,
                    Capability::Power,
                    Capability::AppLaunch,
                    Capability::Touch,
                ] {
                    caps.insert(c);
                }
            }
            ProtocolKind::AirPlay => {
                caps.insert(Capability::AudioSink);
                caps.insert(Capability::OutputRouting);
            }
        }
    }
    caps
}

/// Merges per-protocol service records into device descriptors, keyed by host.
#[derive(Debug)]
pub struct RecordMerger {
    hosts: HashMap<String, HostEntry>,
    last_emitted: HashMap<String, DeviceDescriptor>,
    tv_only: bool,
}

impl RecordMerger {
    pub fn new(tv_only: bool) -> Self {
        Self {
            hosts: HashMap::new(),
            last_emitted: HashMap::new(),
            tv_only,
        }
    }

    /// Adds a record. Returns the host's descriptor if it changed and passes
    /// the model filter.
    pub fn add(&mut self, record: ServiceRecord) -> Option<DeviceDescriptor> {
        let host = record.host.to_ascii_lowercase();
        let entry = self.hosts.entry(host.clone()).or_default();
        entry.records.insert(record.protocol, record);

        if self.tv_only && !entry.is_tv_class() {
            return None;
        }

        let descriptor = entry.descriptor(&host);
        if self.last_emitted.get(&host) == Some(&descriptor) {
            return None;
        }
        self.last_emitted.insert(host, descriptor.clone());
        Some(descriptor)
    }

    /// Final descriptors of every host that passed the filter.
    pub fn into_descriptors(self) -> Vec<DeviceDescriptor> {
        let mut all: Vec<_> = self.last_emitted.into_values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Drops loopback and link-local addresses.
pub fn usable_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local(),
        IpAddr::V6(_) => false,
    }
}
