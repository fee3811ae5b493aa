//! Connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// External accessory protocol the speaker registers while it is on
pub const UE_ROLL_PROTOCOL: &str = "com.logitech.ue.ueroll";

/// GATT services exposed by the speaker while it is off
pub mod services {
    use uuid::Uuid;

    pub const PRIMARY: Uuid = Uuid::from_u128(0x757ed3e4_1828_4a0c_8362_c229c3a6da72);
    pub const GENERIC_ACCESS: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
    pub const GENERIC_ATTRIBUTE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
}

/// GATT characteristics of the speaker
pub mod characteristics {
    use uuid::Uuid;

    pub const POWER_ON: Uuid = Uuid::from_u128(0xc6d6dc0d_07f5_47ef_9b59_630622b01fd3);
    pub const ALARM: Uuid = Uuid::from_u128(0x16e005bb_3862_43c7_8f5c_6f654a4ffdd2);
    pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
    /// Readable and writable
    pub const DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
    pub const FIRMWARE_VERSION: Uuid = Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);
    pub const SERIAL_NUMBER: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
    pub const APPEARANCE: Uuid = Uuid::from_u128(0x00002a01_0000_1000_8000_00805f9b34fb);
    pub const MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
}

/// Configuration shared by the classic and BLE connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerConfig {
    /// Accessory protocol string used to pick the speaker's session
    pub protocol: String,
    /// GATT service holding the power characteristic
    pub primary_service: Uuid,
    /// Characteristic that powers the speaker on when written
    pub power_characteristic: Uuid,
    /// Maximum time to wait for a correlated classic response
    pub request_timeout: Duration,
    /// Capacity of the broadcast channels carrying connection events
    pub event_capacity: usize,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            protocol: UE_ROLL_PROTOCOL.to_string(),
            primary_service: services::PRIMARY,
            power_characteristic: characteristics::POWER_ON,
            request_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

impl SpeakerConfig {
    /// Create a new configuration with the speaker's defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accessory protocol string
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the primary GATT service
    pub fn with_primary_service(mut self, service: Uuid) -> Self {
        self.primary_service = service;
        self
    }

    /// Set the power characteristic
    pub fn with_power_characteristic(mut self, characteristic: Uuid) -> Self {
        self.power_characteristic = characteristic;
        self
    }

    /// Set the classic request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
