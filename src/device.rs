//! Paired-device store.
//!
//! `devices.json` — an array of `{id, publicKey, sharedSecret, createdAt}`.
//! Each `Device` is the per-device AES session key derived once at pairing
//! (§4.1/§4.2) and reused for every subsequent WS frame; there is no rekey.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{atomic_write, config_dir};

/// A paired client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "sharedSecret")]
    pub shared_secret_b64: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// The 32-byte AES-256-GCM key for all WS traffic with this device.
    pub fn shared_secret(&self) -> Result<[u8; 32]> {
        let bytes = BASE64
            .decode(&self.shared_secret_b64)
            .context("invalid stored shared secret")?;
        anyhow::ensure!(bytes.len() == 32, "stored shared secret is not 32 bytes");
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// In-memory, disk-backed table of paired devices.
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: Vec<Device>,
}

impl DeviceStore {
    fn path() -> Result<std::path::PathBuf> {
        Ok(config_dir()?.join("devices.json"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let devices: Vec<Device> = serde_json::from_str(&content)?;
        Ok(Self { devices })
    }

    pub fn save(&self) -> Result<()> {
        atomic_write(&Self::path()?, &serde_json::to_string_pretty(&self.devices)?)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    /// Mint a new device id and persist a freshly paired device.
    pub fn add(&mut self, public_key: String, shared_secret: [u8; 32]) -> Result<Device> {
        let device = Device {
            id: random_device_id(),
            public_key,
            shared_secret_b64: BASE64.encode(shared_secret),
            created_at: Utc::now(),
        };
        self.devices.push(device.clone());
        self.save()?;
        Ok(device)
    }

    /// Remove a device (explicit unpair).
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.devices.len();
        self.devices.retain(|d| d.id != id);
        let removed = self.devices.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }
}

/// 8 random bytes, hex-encoded, as the spec's Device `id`.
fn random_device_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_roundtrips() {
        let device = Device {
            id: "deadbeefdeadbeef".to_string(),
            public_key: "pubkey".to_string(),
            shared_secret_b64: BASE64.encode([5u8; 32]),
            created_at: Utc::now(),
        };
        assert_eq!(device.shared_secret().unwrap(), [5u8; 32]);
    }

    #[test]
    fn device_id_is_unique_per_call() {
        let a = random_device_id();
        let b = random_device_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn store_get_and_remove() {
        let mut store = DeviceStore::default();
        store.devices.push(Device {
            id: "abc".to_string(),
            public_key: "pk".to_string(),
            shared_secret_b64: BASE64.encode([1u8; 32]),
            created_at: Utc::now(),
        });

        assert!(store.get("abc").is_some());
        assert!(store.get("xyz").is_none());

        store.devices.retain(|d| d.id != "abc");
        assert!(store.get("abc").is_none());
    }
}
