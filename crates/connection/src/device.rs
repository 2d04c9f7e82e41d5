//! Durable device record.

use std::net::IpAddr;

use atvlink_protocol::{CapabilitySet, Credential, DeviceDescriptor, DeviceId};
use serde::{Deserialize, Serialize};

/// Identity and durable facts of a device, as persisted by the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// Pairing credential. `None` until the device has been paired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_outputs: Vec<DeviceId>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            credential: None,
            capabilities: CapabilitySet::new(),
            preferred_outputs: Vec::new(),
        }
    }

    /// Builds a record from a discovered device.
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            address: descriptor.address,
            credential: None,
            capabilities: descriptor.capabilities.clone(),
            preferred_outputs: Vec::new(),
        }
    }

    /// Returns the credential if one is stored and non-empty.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref().filter(|c| !c.is_empty())
    }

    pub fn is_paired(&self) -> bool {
        self.credential().is_some()
    }

    /// Descriptor used to reach the device when no fresh discovery result exists.
    pub fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor = DeviceDescriptor::new(self.id.clone(), self.name.clone());
        descriptor.address = self.address;
        descriptor.capabilities = self.capabilities.clone();
        descriptor
    }
}
