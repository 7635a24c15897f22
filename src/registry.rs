//! Device Registry (C2). In-memory map of known devices to their owning
//! connector, persisted as `{configDir}/connected_devices.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::RegistryError;

const CONNECTED_DEVICES_FILE: &str = "connected_devices.json";

/// A device known to the gateway. `connector` is a weak-in-spirit back
/// reference: it is `None` for an orphaned entry loaded from disk whose
/// connector name did not match any loaded connector (spec §4.2).
#[derive(Clone)]
pub struct DeviceRecord<C> {
    pub name: String,
    pub device_type: String,
    pub connector_name: String,
    pub connector: Option<C>,
}

/// The shape persisted to `connected_devices.json`: `deviceName -> connectorName`.
type PersistedDevices = HashMap<String, String>;

pub struct DeviceRegistry<C: Clone> {
    path: PathBuf,
    devices: Mutex<HashMap<String, DeviceRecord<C>>>,
}

impl<C: Clone> DeviceRegistry<C> {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        DeviceRegistry {
            path: config_dir.as_ref().join(CONNECTED_DEVICES_FILE),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the persisted map. Entries are kept without a live `connector`
    /// until `rebind` associates them with a loaded connector (spec §4.2).
    pub async fn load(&self) -> Result<(), RegistryError> {
        let persisted = match tokio::fs::read(&self.path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice::<PersistedDevices>(&bytes)?
            }
            Ok(_) => PersistedDevices::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedDevices::new(),
            Err(e) => return Err(e.into()),
        };

        let mut devices = self.devices.lock().await;
        for (name, connector_name) in persisted {
            devices.insert(
                name.clone(),
                DeviceRecord {
                    name,
                    device_type: "default".to_string(),
                    connector_name,
                    connector: None,
                },
            );
        }
        Ok(())
    }

    /// Rebinds orphaned entries to a freshly loaded connector of matching
    /// name (spec §4.2 "Rebinding on startup").
    pub async fn rebind(&self, connector_name: &str, connector: C) {
        let mut devices = self.devices.lock().await;
        for record in devices.values_mut() {
            if record.connector_name == connector_name {
                record.connector = Some(connector.clone());
            }
        }
    }

    /// Adds a device if not already present, persisting the mutation.
    /// Returns `true` if the device was newly added.
    pub async fn add(
        &self,
        name: &str,
        connector_name: &str,
        connector: C,
        device_type: &str,
    ) -> Result<bool, RegistryError> {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(name) {
            return Ok(false);
        }
        devices.insert(
            name.to_string(),
            DeviceRecord {
                name: name.to_string(),
                device_type: device_type.to_string(),
                connector_name: connector_name.to_string(),
                connector: Some(connector),
            },
        );
        self.save_locked(&devices).await?;
        Ok(true)
    }

    pub async fn update_connector_name(
        &self,
        name: &str,
        connector_name: &str,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().await;
        let changed = match devices.get_mut(name) {
            Some(record) if record.connector_name != connector_name => {
                record.connector_name = connector_name.to_string();
                true
            }
            Some(_) => false,
            None => false,
        };
        if changed {
            self.save_locked(&devices).await?;
        }
        Ok(())
    }

    pub async fn del(&self, name: &str) -> Result<Option<DeviceRecord<C>>, RegistryError> {
        let mut devices = self.devices.lock().await;
        let removed = devices.remove(name);
        if removed.is_some() {
            self.save_locked(&devices).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Option<DeviceRecord<C>> {
        self.devices.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.devices.lock().await.contains_key(name)
    }

    /// Snapshot of `deviceName -> connectorName`, the shape RPC `gateway_devices`
    /// and `eq` comparisons in tests use.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.devices
            .lock()
            .await
            .values()
            .map(|r| (r.name.clone(), r.connector_name.clone()))
            .collect()
    }

    pub async fn all(&self) -> Vec<DeviceRecord<C>> {
        self.devices.lock().await.values().cloned().collect()
    }

    pub async fn save(&self) -> Result<(), RegistryError> {
        let devices = self.devices.lock().await;
        self.save_locked(&devices).await
    }

    async fn save_locked(
        &self,
        devices: &HashMap<String, DeviceRecord<C>>,
    ) -> Result<(), RegistryError> {
        let persisted: std::collections::BTreeMap<&str, &str> = devices
            .values()
            .map(|r| (r.name.as_str(), r.connector_name.as_str()))
            .collect();
        let json = serde_json::to_string_pretty(&persisted)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

pub type SharedRegistry<C> = Arc<DeviceRegistry<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_persists_and_get_returns_record() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let registry: DeviceRegistry<u32> = DeviceRegistry::new(dir.path());

        assert!(registry.add("d1", "c1", 7, "sensor").await.unwrap());
        assert!(!registry.add("d1", "c1", 7, "sensor").await.unwrap());

        let record = registry.get("d1").await.unwrap();
        assert_eq!(record.connector_name, "c1");
        assert_eq!(record.connector, Some(7));

        let on_disk = std::fs::read_to_string(dir.path().join(CONNECTED_DEVICES_FILE)).unwrap();
        let parsed: PersistedDevices = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed.get("d1"), Some(&"c1".to_string()));
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry: DeviceRegistry<u32> = DeviceRegistry::new(dir.path());
        registry.load().await.unwrap();
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn load_then_rebind_attaches_live_connector_to_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONNECTED_DEVICES_FILE),
            r#"{"d1": "c1", "d2": "c2"}"#,
        )
        .unwrap();

        let registry: DeviceRegistry<u32> = DeviceRegistry::new(dir.path());
        registry.load().await.unwrap();
        registry.rebind("c1", 42).await;

        assert_eq!(registry.get("d1").await.unwrap().connector, Some(42));
        assert_eq!(registry.get("d2").await.unwrap().connector, None);
    }

    #[tokio::test]
    async fn del_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry: DeviceRegistry<u32> = DeviceRegistry::new(dir.path());
        registry.add("d1", "c1", 1, "default").await.unwrap();

        let removed = registry.del("d1").await.unwrap();
        assert!(removed.is_some());
        assert!(registry.get("d1").await.is_none());

        let on_disk = std::fs::read_to_string(dir.path().join(CONNECTED_DEVICES_FILE)).unwrap();
        let parsed: PersistedDevices = serde_json::from_str(&on_disk).unwrap();
        assert!(parsed.is_empty());
    }
}
