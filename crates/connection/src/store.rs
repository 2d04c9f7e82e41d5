//! Persistent device configuration.
//!
//! Device records are cached in memory and persisted to a JSON file.
//! Files written by older releases (a bare array of
//! `{identifier, name, credentials}` entries) are migrated on load.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use atvlink_protocol::{Credential, DeviceId, ProtocolCredential, ProtocolKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::DeviceRecord;

const STORE_VERSION: u32 = 2;

/// Errors from the config store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable storage for device records.
pub trait ConfigStore: Send + Sync {
    fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Inserts or replaces the record with the same id.
    fn save_device(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    /// Removes a record. Missing ids are not an error.
    fn delete_device(&self, id: &DeviceId) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    devices: Vec<DeviceRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Current(StoreFile),
    Legacy(Vec<LegacyDevice>),
}

#[derive(Deserialize)]
struct LegacyDevice {
    identifier: String,
    name: String,
    #[serde(default)]
    address: Option<IpAddr>,
    #[serde(default)]
    credentials: Option<LegacyCredentials>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyCredentials {
    /// Single MediaRemote credential string.
    Single(String),
    List(Vec<LegacyProtocolCredential>),
}

#[derive(Deserialize)]
struct LegacyProtocolCredential {
    protocol: String,
    credentials: String,
}

fn legacy_protocol(name: &str) -> Option<ProtocolKind> {
    match name.to_ascii_lowercase().as_str() {
        "airplay" => Some(ProtocolKind::AirPlay),
        "companion" => Some(ProtocolKind::Companion),
        "mrp" | "mediaremote" => Some(ProtocolKind::MediaRemote),
        _ => None,
    }
}

impl From<LegacyDevice> for DeviceRecord {
    fn from(legacy: LegacyDevice) -> Self {
        let mut record = DeviceRecord::new(legacy.identifier, legacy.name);
        record.address = legacy.address;
        let mut credential = Credential::new();
        match legacy.credentials {
            Some(LegacyCredentials::Single(secret)) if !secret.is_empty() => {
                credential.insert(ProtocolCredential {
                    protocol: ProtocolKind::MediaRemote,
                    secret,
                });
            }
            Some(LegacyCredentials::List(parts)) => {
                for part in parts {
                    match legacy_protocol(&part.protocol) {
                        Some(protocol) if !part.credentials.is_empty() => {
                            credential.insert(ProtocolCredential {
                                protocol,
                                secret: part.credentials,
                            });
                        }
                        Some(_) => {}
                        None => debug!(protocol = %part.protocol, "skipping unknown legacy credential"),
                    }
                }
            }
            _ => {}
        }
        if !credential.is_empty() {
            record.credential = Some(credential);
        }
        record
    }
}

/// JSON-file backed store.
pub struct JsonFileStore {
    path: PathBuf,
    devices: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
}

impl JsonFileStore {
    /// Opens the store, loading (and migrating) existing records from disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let (records, migrated) = load_records(&path)?;
        let store = Self {
            path,
            devices: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        };
        if migrated {
            let devices = store.lock();
            store.persist(&devices)?;
            info!(
                count = devices.len(),
                path = %store.path.display(),
                "migrated legacy device configuration"
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<DeviceId, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the records to disk. Called with the lock held so writes stay ordered.
    fn persist(&self, devices: &BTreeMap<DeviceId, DeviceRecord>) -> Result<(), StoreError> {
        let file = StoreFile {
            version: STORE_VERSION,
            devices: devices.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} device(s) to {:?}", devices.len(), self.path);
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn save_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let mut devices = self.lock();
        devices.insert(record.id.clone(), record.clone());
        self.persist(&devices)
    }

    fn delete_device(&self, id: &DeviceId) -> Result<(), StoreError> {
        let mut devices = self.lock();
        if devices.remove(id).is_none() {
            return Ok(());
        }
        self.persist(&devices)
    }
}

/// Loads records from disk. The flag is set when the file used the legacy shape.
fn load_records(path: &Path) -> Result<(Vec<DeviceRecord>, bool), StoreError> {
    if !path.exists() {
        return Ok((Vec::new(), false));
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok((Vec::new(), false));
    }
    let parsed: OnDisk = serde_json::from_str(&data)?;
    Ok(match parsed {
        OnDisk::Current(file) => {
            debug!("loaded {} device(s) from {:?}", file.devices.len(), path);
            (file.devices, false)
        }
        OnDisk::Legacy(entries) => (entries.into_iter().map(DeviceRecord::from).collect(), true),
    })
}

/// In-memory store, for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            devices: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl ConfigStore for MemoryStore {
    fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn save_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete_device(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, JsonFileStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path().join("devices.json")).unwrap();
        (tmp, store)
    }

    fn paired(id: &str) -> DeviceRecord {
        let mut record = DeviceRecord::new(id, "Living Room");
        record.credential = Some(Credential::from(vec![ProtocolCredential {
            protocol: ProtocolKind::Companion,
            secret: "secret".into(),
        }]));
        record
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.load_devices().unwrap().is_empty());
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("devices.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.save_device(&paired("tv-1")).unwrap();
            store.save_device(&DeviceRecord::new("tv-2", "Den")).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let devices = store.load_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], paired("tv-1"));
        assert!(!devices[1].is_paired());
    }

    #[test]
    fn save_replaces_and_delete_is_idempotent() {
        let (_tmp, store) = test_store();
        store.save_device(&DeviceRecord::new("tv-1", "Old")).unwrap();
        store.save_device(&DeviceRecord::new("tv-1", "New")).unwrap();
        let devices = store.load_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "New");

        store.delete_device(&DeviceId::new("tv-1")).unwrap();
        store.delete_device(&DeviceId::new("tv-1")).unwrap();
        assert!(store.load_devices().unwrap().is_empty());
    }

    #[test]
    fn migrates_legacy_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("devices.json");
        std::fs::write(
            &path,
            r#"[
                {"identifier": "AA:BB", "name": "Bedroom", "address": "10.0.0.9",
                 "credentials": [
                    {"protocol": "airplay", "credentials": "air-secret"},
                    {"protocol": "companion", "credentials": "comp-secret"},
                    {"protocol": "dmap", "credentials": "ignored"}
                 ]},
                {"identifier": "CC:DD", "name": "Office", "credentials": "mrp-secret"},
                {"identifier": "EE:FF", "name": "Kitchen"}
            ]"#,
        )
        .unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let devices = store.load_devices().unwrap();
        assert_eq!(devices.len(), 3);

        let bedroom = &devices[0];
        assert_eq!(bedroom.id.as_str(), "AA:BB");
        assert_eq!(bedroom.address, Some("10.0.0.9".parse().unwrap()));
        let credential = bedroom.credential().unwrap();
        assert_eq!(credential.get(ProtocolKind::AirPlay), Some("air-secret"));
        assert_eq!(credential.get(ProtocolKind::Companion), Some("comp-secret"));
        assert_eq!(credential.protocols().count(), 2);

        let office = &devices[1];
        assert_eq!(
            office.credential().unwrap().get(ProtocolKind::MediaRemote),
            Some("mrp-secret")
        );
        assert!(!devices[2].is_paired());

        // Rewritten in the current shape.
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["devices"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("devices.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(StoreError::Json(_))));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.save_device(&paired("tv-1")).unwrap();
        assert!(store.get(&DeviceId::new("tv-1")).unwrap().is_paired());
        store.delete_device(&DeviceId::new("tv-1")).unwrap();
        assert!(store.load_devices().unwrap().is_empty());
    }
}
