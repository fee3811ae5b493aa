//! BLE central capability
//!
//! Defines the radio surface the BLE connection drives. The platform stack
//! (CoreBluetooth, BlueZ, WinRT) sits behind this trait; enable the `btleplug`
//! feature for an implementation on top of btleplug.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

#[cfg(feature = "btleplug")]
mod btleplug_central;

#[cfg(feature = "btleplug")]
pub use btleplug_central::BtleplugCentral;

/// Platform identifier of a peripheral
pub type PeripheralId = String;

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// A discovered GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service: Uuid,
    pub writable_without_response: bool,
}

impl GattCharacteristic {
    /// Prefer writes without response when the characteristic allows them
    pub fn preferred_write_type(&self) -> WriteType {
        if self.writable_without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }
}

/// Notification from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A peripheral advertised during a scan
    Discovered {
        id: PeripheralId,
        /// Raw manufacturer-specific advertisement payload, company id included
        manufacturer_data: Vec<u8>,
    },
    /// A connected peripheral went away
    Disconnected(PeripheralId),
}

/// BLE central role used to reach the speaker while it is off
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Resolve once the radio is powered on and able to scan
    async fn wait_until_ready(&self) -> Result<()>;

    /// Subscribe to discovery and disconnect notifications
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    /// Scan for every peripheral, without a service filter
    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Discover the services of a connected peripheral
    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>>;

    /// Discover the characteristics of one service
    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>>;

    /// Write a characteristic value and resolve with the platform's outcome
    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
}
