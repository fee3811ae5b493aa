use crate::config::SpeakerConfig;
use crate::error::{Result, SpeakerError};
use crate::preferences::{stored_mac, PreferenceStore};
use crate::radio::{BleCentral, GattCharacteristic, PeripheralId, RadioEvent};
use crate::types::MacAddress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

/// Byte appended to the host MAC in the power-on write.
///
/// The vendor never documented it; the speaker ignores the write without it.
pub const POWER_ON_PAD: u8 = 0x01;

/// Build the value written to the power characteristic
pub fn power_on_payload(host_mac: &MacAddress) -> Vec<u8> {
    let mut payload = host_mac.as_bytes().to_vec();
    payload.push(POWER_ON_PAD);
    payload
}

/// Event emitted by the BLE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowEnergyEvent {
    /// The speaker was found and its power characteristic resolved
    Ready,
    /// The speaker's peripheral disconnected
    Disconnected,
}

/// The speaker's peripheral together with what was discovered on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub services: Vec<Uuid>,
    pub power_characteristic: GattCharacteristic,
}

#[derive(Debug)]
enum Link {
    Idle,
    Scanning,
    Connecting(PeripheralId),
    Ready(PeripheralHandle),
}

enum Request {
    Connect { reply: oneshot::Sender<Result<()>> },
    Rescan { reply: oneshot::Sender<Result<()>> },
    Stop { reply: oneshot::Sender<Result<()>> },
    PowerOn { reply: oneshot::Sender<Result<()>> },
}

struct LowEnergyState {
    radio: Arc<dyn BleCentral>,
    preferences: Arc<dyn PreferenceStore>,
    primary_service: Uuid,
    power_characteristic: Uuid,
    /// Present once `connect()` has run
    radio_events: Option<broadcast::Receiver<RadioEvent>>,
    link: Link,
    events: broadcast::Sender<LowEnergyEvent>,
    ready: Arc<AtomicBool>,
}

/// BLE connection to the speaker
///
/// Only reachable while the speaker is off. The speaker does not advertise its
/// services, so every peripheral is inspected and the one whose manufacturer
/// data equals the stored device MAC is picked.
pub struct LowEnergyConnection {
    request_tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<LowEnergyEvent>,
    ready: Arc<AtomicBool>,
}

impl LowEnergyConnection {
    /// Create the connection and spawn its task. Must be called inside a tokio runtime.
    pub fn new(
        radio: Arc<dyn BleCentral>,
        preferences: Arc<dyn PreferenceStore>,
        config: &SpeakerConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let ready = Arc::new(AtomicBool::new(false));

        let state = LowEnergyState {
            radio,
            preferences,
            primary_service: config.primary_service,
            power_characteristic: config.power_characteristic,
            radio_events: None,
            link: Link::Idle,
            events: events.clone(),
            ready: ready.clone(),
        };
        tokio::spawn(run_low_energy(state, request_rx));

        Self {
            request_tx,
            events,
            ready,
        }
    }

    /// Subscribe to readiness/disconnect events
    pub fn subscribe(&self) -> broadcast::Receiver<LowEnergyEvent> {
        self.events.subscribe()
    }

    /// Whether the power characteristic is resolved and writable
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Power up the radio and start looking for the speaker
    ///
    /// Does nothing if already connecting or connected. [`LowEnergyEvent::Ready`]
    /// is emitted once the speaker has been found.
    pub async fn connect(&self) -> Result<()> {
        self.call(|reply| Request::Connect { reply }).await
    }

    /// Forget the current peripheral and scan again
    pub async fn rescan(&self) -> Result<()> {
        self.call(|reply| Request::Rescan { reply }).await
    }

    /// Stop scanning and forget the peripheral
    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| Request::Stop { reply }).await
    }

    /// Write the power-on value and wait for the platform's outcome
    pub async fn request_power_on(&self) -> Result<()> {
        self.call(|reply| Request::PowerOn { reply }).await
    }

    async fn call(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(build(tx))
            .map_err(|_| SpeakerError::ConnectionClosed)?;
        rx.await.map_err(|_| SpeakerError::ConnectionClosed)?
    }
}

async fn run_low_energy(mut state: LowEnergyState, mut request_rx: mpsc::UnboundedReceiver<Request>) {
    loop {
        tokio::select! {
            request = request_rx.recv() => match request {
                Some(request) => state.handle_request(request).await,
                None => break,
            },
            event = next_radio_event(&mut state.radio_events) => {
                state.handle_radio_event(event).await;
            }
        }
    }

    if matches!(state.link, Link::Scanning) {
        let _ = state.radio.stop_scan().await;
    }
    tracing::debug!("BLE connection task exited");
}

async fn next_radio_event(
    rx: &mut Option<broadcast::Receiver<RadioEvent>>,
) -> std::result::Result<RadioEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl LowEnergyState {
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            Request::Rescan { reply } => {
                let _ = reply.send(self.rescan().await);
            }
            Request::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Request::PowerOn { reply } => {
                let _ = reply.send(self.power_on().await);
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.radio_events.is_some() {
            tracing::debug!("BLE connection already started");
            return Ok(());
        }

        self.radio.wait_until_ready().await?;
        let events = self.radio.subscribe();
        tracing::info!("Starting BLE peripheral scan");
        if let Err(e) = self.scan().await {
            self.link = Link::Idle;
            return Err(e);
        }
        self.radio_events = Some(events);
        Ok(())
    }

    async fn rescan(&mut self) -> Result<()> {
        if self.radio_events.is_none() {
            return Err(SpeakerError::NotStarted);
        }

        if let Err(e) = self.radio.stop_scan().await {
            tracing::debug!("Failed to stop BLE scan: {}", e);
        }
        self.forget_peripheral();
        tracing::info!("Rescanning for speaker via BLE");
        self.scan().await
    }

    async fn stop(&mut self) -> Result<()> {
        if self.radio_events.take().is_none() {
            return Err(SpeakerError::NotStarted);
        }

        if let Err(e) = self.radio.stop_scan().await {
            tracing::debug!("Failed to stop BLE scan: {}", e);
        }
        self.forget_peripheral();
        Ok(())
    }

    async fn scan(&mut self) -> Result<()> {
        if stored_mac(self.preferences.device_mac(), "device MAC").is_none() {
            tracing::warn!("Scanning without a device MAC, the speaker will never match");
        }
        if stored_mac(self.preferences.host_mac(), "host MAC").is_none() {
            tracing::warn!("No host MAC stored, power on will not be possible");
        }

        self.link = Link::Scanning;
        self.radio.start_scan().await
    }

    fn forget_peripheral(&mut self) {
        self.link = Link::Idle;
        self.ready.store(false, Ordering::SeqCst);
    }

    async fn handle_radio_event(
        &mut self,
        event: std::result::Result<RadioEvent, broadcast::error::RecvError>,
    ) {
        match event {
            Ok(RadioEvent::Discovered {
                id,
                manufacturer_data,
            }) => self.handle_discovery(id, manufacturer_data).await,
            Ok(RadioEvent::Disconnected(id)) => {
                let ours = match &self.link {
                    Link::Connecting(current) => *current == id,
                    Link::Ready(handle) => handle.id == id,
                    _ => false,
                };
                if ours {
                    tracing::info!("Disconnected from speaker via BLE: {}", id);
                    self.forget_peripheral();
                    let _ = self.events.send(LowEnergyEvent::Disconnected);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} BLE radio events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!("BLE radio events ended");
                self.radio_events = None;
            }
        }
    }

    async fn handle_discovery(&mut self, id: PeripheralId, manufacturer_data: Vec<u8>) {
        if !matches!(self.link, Link::Scanning) {
            return;
        }

        let target = match self
            .preferences
            .device_mac()
            .and_then(|mac| mac.parse::<MacAddress>().ok())
        {
            Some(target) => target,
            None => return,
        };
        if manufacturer_data.as_slice() != target.as_bytes() {
            return;
        }

        tracing::info!("Found speaker via BLE: {}", id);
        if let Err(e) = self.radio.stop_scan().await {
            tracing::warn!("Failed to stop BLE scan: {}", e);
        }
        self.link = Link::Connecting(id.clone());

        match self.resolve_peripheral(&id).await {
            Ok(handle) => {
                self.link = Link::Ready(handle);
                self.ready.store(true, Ordering::SeqCst);
                let _ = self.events.send(LowEnergyEvent::Ready);
            }
            Err(e) => {
                tracing::error!("Failed to set up speaker peripheral {}: {}", id, e);
                self.link = Link::Idle;
            }
        }
    }

    /// Connect, then walk services and characteristics down to the power characteristic
    async fn resolve_peripheral(&self, id: &PeripheralId) -> Result<PeripheralHandle> {
        self.radio.connect(id).await?;
        tracing::info!("Connected to speaker via BLE: {}", id);

        let services = self.radio.discover_services(id).await?;
        if !services.contains(&self.primary_service) {
            return Err(SpeakerError::Ble(format!(
                "primary service {} not found",
                self.primary_service
            )));
        }

        let power_characteristic = self
            .radio
            .discover_characteristics(id, self.primary_service)
            .await?
            .into_iter()
            .find(|c| c.uuid == self.power_characteristic)
            .ok_or_else(|| {
                SpeakerError::Ble(format!(
                    "power characteristic {} not found",
                    self.power_characteristic
                ))
            })?;

        Ok(PeripheralHandle {
            id: id.clone(),
            services,
            power_characteristic,
        })
    }

    async fn power_on(&self) -> Result<()> {
        let handle = match &self.link {
            Link::Ready(handle) => handle,
            _ => return Err(SpeakerError::NotConnected),
        };

        let host_mac: MacAddress = self
            .preferences
            .host_mac()
            .ok_or(SpeakerError::MissingPreference("hostMAC"))?
            .parse()?;

        let characteristic = &handle.power_characteristic;
        let result = self
            .radio
            .write(
                &handle.id,
                characteristic,
                &power_on_payload(&host_mac),
                characteristic.preferred_write_type(),
            )
            .await;

        match &result {
            Ok(()) => tracing::info!("Wrote power on value to {}", handle.id),
            Err(e) => tracing::error!("Error writing power on value: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_payload_appends_pad() {
        let host: MacAddress = "cc2db748bc1e".parse().unwrap();
        assert_eq!(
            power_on_payload(&host),
            vec![0xcc, 0x2d, 0xb7, 0x48, 0xbc, 0x1e, 0x01]
        );
    }
}
