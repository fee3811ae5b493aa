//! Persisted MAC address preferences
//!
//! The BLE path can only find and authenticate with the speaker once both the
//! host's and the speaker's MAC addresses are known. They are discovered once
//! over classic Bluetooth and kept in a [`PreferenceStore`].

use crate::error::Result;
use crate::types::MacAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Two string slots holding the host and speaker MAC addresses
pub trait PreferenceStore: Send + Sync {
    fn host_mac(&self) -> Option<String>;

    fn set_host_mac(&self, mac: &str) -> Result<()>;

    fn device_mac(&self) -> Option<String>;

    fn set_device_mac(&self, mac: &str) -> Result<()>;
}

/// Parse a stored MAC, logging instead of failing when it is malformed
pub(crate) fn stored_mac(value: Option<String>, slot: &str) -> Option<MacAddress> {
    let value = value?;
    match value.parse() {
        Ok(mac) => Some(mac),
        Err(e) => {
            tracing::warn!("Ignoring malformed {} preference {:?}: {}", slot, value, e);
            None
        }
    }
}

/// Whether the MAC bootstrap still has to run
pub fn needs_bootstrap(store: &dyn PreferenceStore) -> bool {
    stored_mac(store.host_mac(), "host MAC").is_none()
        || stored_mac(store.device_mac(), "device MAC").is_none()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StoredMacs {
    #[serde(rename = "host-mac", default, skip_serializing_if = "Option::is_none")]
    host_mac: Option<String>,
    #[serde(rename = "device-mac", default, skip_serializing_if = "Option::is_none")]
    device_mac: Option<String>,
}

/// Preferences held in memory only
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RwLock<StoredMacs>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with both slots already filled
    pub fn with_macs(host_mac: impl Into<String>, device_mac: impl Into<String>) -> Self {
        Self {
            values: RwLock::new(StoredMacs {
                host_mac: Some(host_mac.into()),
                device_mac: Some(device_mac.into()),
            }),
        }
    }
}

impl PreferenceStore for MemoryPreferences {
    fn host_mac(&self) -> Option<String> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).host_mac.clone()
    }

    fn set_host_mac(&self, mac: &str) -> Result<()> {
        self.values.write().unwrap_or_else(PoisonError::into_inner).host_mac = Some(mac.to_string());
        Ok(())
    }

    fn device_mac(&self) -> Option<String> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).device_mac.clone()
    }

    fn set_device_mac(&self, mac: &str) -> Result<()> {
        self.values.write().unwrap_or_else(PoisonError::into_inner).device_mac = Some(mac.to_string());
        Ok(())
    }
}

/// Preferences persisted as a small JSON document
///
/// ```json
/// { "host-mac": "cc2db748bc1e", "device-mac": "c0288d020f2b" }
/// ```
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: RwLock<StoredMacs>,
}

impl JsonFilePreferences {
    /// Load preferences from `path`; a missing file starts out empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No preferences at {}, starting empty", path.display());
                StoredMacs::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut StoredMacs)) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut values);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&*values)?)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn host_mac(&self) -> Option<String> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).host_mac.clone()
    }

    fn set_host_mac(&self, mac: &str) -> Result<()> {
        self.update(|v| v.host_mac = Some(mac.to_string()))
    }

    fn device_mac(&self) -> Option<String> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).device_mac.clone()
    }

    fn set_device_mac(&self, mac: &str) -> Result<()> {
        self.update(|v| v.device_mac = Some(mac.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_preferences() {
        let prefs = MemoryPreferences::new();
        assert!(needs_bootstrap(&prefs));

        prefs.set_host_mac("cc2db748bc1e").unwrap();
        assert!(needs_bootstrap(&prefs));

        prefs.set_device_mac("c0288d020f2b").unwrap();
        assert!(!needs_bootstrap(&prefs));
        assert_eq!(prefs.device_mac().as_deref(), Some("c0288d020f2b"));
    }

    #[test]
    fn test_malformed_mac_still_needs_bootstrap() {
        let prefs = MemoryPreferences::with_macs("cc2db748bc1e", "not-a-mac");
        assert!(needs_bootstrap(&prefs));
        assert!(stored_mac(prefs.device_mac(), "device MAC").is_none());
    }

    #[test]
    fn test_json_preferences_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs").join("speaker.json");

        let prefs = JsonFilePreferences::open(&path).unwrap();
        assert!(prefs.host_mac().is_none());
        prefs.set_host_mac("cc2db748bc1e").unwrap();
        prefs.set_device_mac("c0288d020f2b").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["host-mac"], "cc2db748bc1e");
        assert_eq!(json["device-mac"], "c0288d020f2b");

        let reopened = JsonFilePreferences::open(&path).unwrap();
        assert_eq!(reopened.host_mac().as_deref(), Some("cc2db748bc1e"));
        assert_eq!(reopened.device_mac().as_deref(), Some("c0288d020f2b"));
    }

    #[test]
    fn test_json_preferences_reject_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speaker.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonFilePreferences::open(&path),
            Err(crate::error::SpeakerError::Json(_))
        ));
    }
}
