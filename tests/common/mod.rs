#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use ue_speaker_control::{
    characteristics, services, Accessory, AccessoryEvent, AccessoryId, AccessoryProvider,
    BleCentral, GattCharacteristic, PeripheralId, RadioEvent, Result, Session, SpeakerError,
    SpeakerState, StateReceiver, WriteType, UE_ROLL_PROTOCOL,
};
use uuid::Uuid;

pub const HOST_MAC: &str = "cc2db748bc1e";
pub const DEVICE_MAC: &str = "c0288d020f2b";

/// `returnHostAddress` carrying [`HOST_MAC`]
pub const HOST_RESPONSE: [u8; 9] = [0x08, 0x01, 0xAD, 0xcc, 0x2d, 0xb7, 0x48, 0xbc, 0x1e];
/// `returnDeviceAddress` carrying [`DEVICE_MAC`]
pub const DEVICE_RESPONSE: [u8; 9] = [0x08, 0x01, 0xAF, 0xc0, 0x28, 0x8d, 0x02, 0x0f, 0x2b];

const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn speaker(id: AccessoryId) -> Accessory {
    Accessory {
        id,
        name: "UE ROLL".to_string(),
        protocol_strings: vec![UE_ROLL_PROTOCOL.to_string()],
    }
}

pub fn headphones(id: AccessoryId) -> Accessory {
    Accessory {
        id,
        name: "Headphones".to_string(),
        protocol_strings: vec!["com.example.headphones".to_string()],
    }
}

/// Fail the test if `future` does not finish in time
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for the speaker")
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

pub async fn wait_for_state(states: &mut StateReceiver, want: SpeakerState) {
    within(async {
        while states.current() != want {
            states.recv().await.unwrap();
        }
    })
    .await
}

pub async fn read_bytes(remote: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    within(remote.read_exact(&mut buf)).await.unwrap();
    buf
}

pub async fn write_bytes(remote: &mut DuplexStream, bytes: &[u8]) {
    remote.write_all(bytes).await.unwrap();
}

/// Accessory provider backed by in-memory duplex pipes
///
/// Every opened session's far end is handed to the test through the receiver
/// returned by [`MockAccessories::new`].
pub struct MockAccessories {
    connected: Mutex<Vec<Accessory>>,
    events: broadcast::Sender<AccessoryEvent>,
    sessions: mpsc::UnboundedSender<DuplexStream>,
}

impl MockAccessories {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (events, _) = broadcast::channel(16);
        let (sessions, sessions_rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            connected: Mutex::new(Vec::new()),
            events,
            sessions,
        });
        (provider, sessions_rx)
    }

    pub fn attach(&self, accessory: Accessory) {
        self.connected.lock().unwrap().push(accessory.clone());
        let _ = self.events.send(AccessoryEvent::Connected(accessory));
    }

    pub fn detach(&self, id: AccessoryId) {
        self.connected.lock().unwrap().retain(|a| a.id != id);
        let _ = self.events.send(AccessoryEvent::Disconnected(id));
    }
}

#[async_trait]
impl AccessoryProvider for MockAccessories {
    fn connected_accessories(&self) -> Vec<Accessory> {
        self.connected.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessoryEvent> {
        self.events.subscribe()
    }

    async fn open_session(&self, _accessory: &Accessory, _protocol: &str) -> Result<Session> {
        let (local, remote) = tokio::io::duplex(256);
        self.sessions
            .send(remote)
            .map_err(|_| SpeakerError::ConnectionClosed)?;
        Ok(Box::new(local))
    }
}

/// Something the code under test asked the radio to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Write {
        id: PeripheralId,
        value: Vec<u8>,
        write_type: WriteType,
    },
}

/// BLE central that records calls and lets the test inject advertisements
pub struct MockCentral {
    events: broadcast::Sender<RadioEvent>,
    calls: Mutex<Vec<RadioCall>>,
    services: Vec<Uuid>,
    fail_writes: AtomicBool,
    fail_next_scan: AtomicBool,
}

impl MockCentral {
    /// A radio where every peripheral looks like the speaker's GATT layout
    pub fn new() -> Arc<Self> {
        Self::with_services(vec![services::GENERIC_ACCESS, services::PRIMARY])
    }

    pub fn with_services(services: Vec<Uuid>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            services,
            fail_writes: AtomicBool::new(false),
            fail_next_scan: AtomicBool::new(false),
        })
    }

    pub fn advertise(&self, id: &str, manufacturer_data: &[u8]) {
        let _ = self.events.send(RadioEvent::Discovered {
            id: id.to_string(),
            manufacturer_data: manufacturer_data.to_vec(),
        });
    }

    pub fn disconnect(&self, id: &str) {
        let _ = self.events.send(RadioEvent::Disconnected(id.to_string()));
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_scan(&self) {
        self.fail_next_scan.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn writes(&self) -> Vec<RadioCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, RadioCall::Write { .. }))
            .collect()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn wait_until_ready(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(RadioCall::StartScan);
        if self.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(SpeakerError::Ble("scan refused".to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.record(RadioCall::Connect(id.clone()));
        Ok(())
    }

    async fn discover_services(&self, _id: &PeripheralId) -> Result<Vec<Uuid>> {
        Ok(self.services.clone())
    }

    async fn discover_characteristics(
        &self,
        _id: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>> {
        if service != services::PRIMARY {
            return Ok(Vec::new());
        }
        Ok(vec![
            GattCharacteristic {
                uuid: characteristics::ALARM,
                service,
                writable_without_response: false,
            },
            GattCharacteristic {
                uuid: characteristics::POWER_ON,
                service,
                writable_without_response: true,
            },
        ])
    }

    async fn write(
        &self,
        id: &PeripheralId,
        _characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(RadioCall::Write {
            id: id.clone(),
            value: value.to_vec(),
            write_type,
        });
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SpeakerError::Ble("write rejected".to_string()));
        }
        Ok(())
    }
}

/// Bytes of a MAC in the form the speaker advertises it
pub fn mac_bytes(mac: &str) -> Vec<u8> {
    hex::decode(mac).unwrap()
}
