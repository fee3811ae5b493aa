use super::{BleCentral, GattCharacteristic, PeripheralId, RadioEvent, WriteType};
use crate::error::{Result, SpeakerError};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long to wait for the adapter to report powered on before scanning anyway
const POWER_ON_GRACE: Duration = Duration::from_secs(3);

type PlatformIds = Arc<Mutex<HashMap<PeripheralId, btleplug::platform::PeripheralId>>>;

/// [`BleCentral`] on top of the first btleplug adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    ids: PlatformIds,
    events: broadcast::Sender<RadioEvent>,
    event_task: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Open the first Bluetooth adapter on the system
    pub async fn new(event_capacity: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SpeakerError::Ble("No Bluetooth adapter found".to_string()))?;
        Self::with_adapter(adapter, event_capacity).await
    }

    /// Use a specific adapter
    pub async fn with_adapter(adapter: Adapter, event_capacity: usize) -> Result<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let ids: PlatformIds = Arc::new(Mutex::new(HashMap::new()));

        let stream = adapter.events().await?;
        let event_task = tokio::spawn(pump_events(stream, ids.clone(), events.clone()));

        Ok(Self {
            adapter,
            ids,
            events,
            event_task,
        })
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        let platform_id = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| SpeakerError::Ble(format!("Unknown peripheral {}", id)))?;
        Ok(self.adapter.peripheral(&platform_id).await?)
    }

    fn characteristic(peripheral: &Peripheral, target: &GattCharacteristic) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service)
            .ok_or_else(|| SpeakerError::Ble(format!("Characteristic {} not discovered", target.uuid)))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

/// Translate adapter events into [`RadioEvent`]s
async fn pump_events(
    mut stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>,
    ids: PlatformIds,
    events: broadcast::Sender<RadioEvent>,
) {
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                let key = id.to_string();
                ids.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone(), id);

                // btleplug splits off the company id; put the raw payload back together.
                for (company_id, data) in manufacturer_data {
                    let mut raw = company_id.to_le_bytes().to_vec();
                    raw.extend_from_slice(&data);
                    let _ = events.send(RadioEvent::Discovered {
                        id: key.clone(),
                        manufacturer_data: raw,
                    });
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = events.send(RadioEvent::Disconnected(id.to_string()));
            }
            _ => {}
        }
    }
    tracing::debug!("Bluetooth adapter event stream ended");
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn wait_until_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + POWER_ON_GRACE;
        loop {
            match self.adapter.adapter_state().await? {
                CentralState::PoweredOn => return Ok(()),
                state if tokio::time::Instant::now() >= deadline => {
                    tracing::warn!("Adapter still {:?}, scanning anyway", state);
                    return Ok(());
                }
                state => tracing::debug!("Adapter state {:?}, waiting", state),
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        Ok(self.adapter.start_scan(ScanFilter::default()).await?)
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(self.adapter.stop_scan().await?)
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().into_iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>> {
        let peripheral = self.peripheral(id).await?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| SpeakerError::Ble(format!("Service {} not discovered", service)))?;

        Ok(service
            .characteristics
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service: c.service_uuid,
                writable_without_response: c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            })
            .collect())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        Ok(peripheral.write(&characteristic, value, write_type).await?)
    }
}
