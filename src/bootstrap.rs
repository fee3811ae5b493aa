//! One-time discovery of the host's and the speaker's MAC addresses
//!
//! The BLE path needs both addresses: the speaker's to recognise its
//! advertisement and the host's to authorise the power-on write. Both can only
//! be read over classic Bluetooth, so this runs once while the speaker is on
//! and stores them in the [`PreferenceStore`].
//!
//! The exchange is strictly sequential:
//!
//! ```text
//! Scanning --session--> WaitingForHostMac --9 bytes--> WaitingForDeviceMac --9 bytes--> Success
//! ```

use crate::accessory::{AccessoryEvent, AccessoryProvider};
use crate::channel::{Channel, ChannelEvent, Framing};
use crate::config::SpeakerConfig;
use crate::error::{Result, SpeakerError};
use crate::preferences::{needs_bootstrap, stored_mac, PreferenceStore};
use crate::protocol::{self, Command, Packet, MAC_RESPONSE_LEN};
use crate::types::{Accessory, AccessoryId, MacAddress};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Progress of the MAC bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    /// Waiting for the speaker's accessory to show up
    Scanning,
    WaitingForHostMac,
    WaitingForDeviceMac,
    Success {
        host_mac: MacAddress,
        device_mac: MacAddress,
    },
    /// The speaker sent more bytes than a MAC response holds; no recovery
    Failed {
        response: String,
    },
}

/// Side effect requested by [`MacBootstrap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    Send(Packet),
    HostMacDiscovered(MacAddress),
    DeviceMacDiscovered(MacAddress),
    Failed { response: String },
}

/// The bootstrap state machine, without any I/O
///
/// Responses are accumulated as raw bytes: a MAC response is exactly
/// 9 bytes, the first 3 of which are discarded.
#[derive(Debug)]
pub struct MacBootstrap {
    state: BootstrapState,
    host_mac: Option<MacAddress>,
    buffer: Vec<u8>,
}

impl Default for MacBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl MacBootstrap {
    pub fn new() -> Self {
        Self {
            state: BootstrapState::Scanning,
            host_mac: None,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            BootstrapState::Success { .. } | BootstrapState::Failed { .. }
        )
    }

    /// A session to the speaker is open; ask for the host MAC
    pub fn on_session_opened(&mut self) -> Vec<BootstrapAction> {
        if self.state != BootstrapState::Scanning {
            return Vec::new();
        }
        self.buffer.clear();
        self.state = BootstrapState::WaitingForHostMac;
        vec![BootstrapAction::Send(Command::QUERY_HOST_ADDRESS.packet())]
    }

    /// Feed bytes read from the session
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Vec<BootstrapAction> {
        if !matches!(
            self.state,
            BootstrapState::WaitingForHostMac | BootstrapState::WaitingForDeviceMac
        ) {
            return Vec::new();
        }

        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAC_RESPONSE_LEN {
            return self.fail(hex::encode(&self.buffer));
        }
        if self.buffer.len() < MAC_RESPONSE_LEN {
            // wait for more data
            return Vec::new();
        }

        let mac = match protocol::parse_mac_bytes(&std::mem::take(&mut self.buffer)) {
            Ok(mac) => mac,
            Err(e) => return self.fail(e.to_string()),
        };

        match self.state {
            BootstrapState::WaitingForHostMac => {
                self.host_mac = Some(mac);
                self.state = BootstrapState::WaitingForDeviceMac;
                vec![
                    BootstrapAction::HostMacDiscovered(mac),
                    BootstrapAction::Send(Command::QUERY_DEVICE_ADDRESS.packet()),
                ]
            }
            _ => match self.host_mac {
                Some(host_mac) => {
                    self.state = BootstrapState::Success {
                        host_mac,
                        device_mac: mac,
                    };
                    vec![BootstrapAction::DeviceMacDiscovered(mac)]
                }
                None => self.fail("device MAC arrived before host MAC".to_string()),
            },
        }
    }

    /// The session went away before the bootstrap finished; start over
    pub fn on_session_closed(&mut self) {
        if self.is_finished() {
            return;
        }
        self.buffer.clear();
        self.host_mac = None;
        self.state = BootstrapState::Scanning;
    }

    fn fail(&mut self, response: String) -> Vec<BootstrapAction> {
        self.buffer.clear();
        self.state = BootstrapState::Failed {
            response: response.clone(),
        };
        vec![BootstrapAction::Failed { response }]
    }
}

/// Event emitted by the scanner
#[derive(Debug, Clone)]
pub enum BootstrapEvent {
    HostMacDiscovered(MacAddress),
    DeviceMacDiscovered(MacAddress),
    Error(Arc<SpeakerError>),
}

enum Request {
    Start { reply: oneshot::Sender<Result<()>> },
    Stop { reply: oneshot::Sender<Result<()>> },
}

struct ScannerSession {
    accessory_id: AccessoryId,
    channel: Channel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

struct ScannerState {
    provider: Arc<dyn AccessoryProvider>,
    preferences: Arc<dyn PreferenceStore>,
    protocol: String,
    started: bool,
    accessory_events: Option<broadcast::Receiver<AccessoryEvent>>,
    session: Option<ScannerSession>,
    machine: MacBootstrap,
    events: broadcast::Sender<BootstrapEvent>,
    progress: watch::Sender<BootstrapState>,
}

/// Runs [`MacBootstrap`] against the speaker's classic accessory session
pub struct MacAddressScanner {
    request_tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<BootstrapEvent>,
    progress: watch::Sender<BootstrapState>,
}

impl MacAddressScanner {
    /// Create the scanner and spawn its task. Must be called inside a tokio runtime.
    pub fn new(
        provider: Arc<dyn AccessoryProvider>,
        preferences: Arc<dyn PreferenceStore>,
        config: &SpeakerConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (progress, _) = watch::channel(BootstrapState::Scanning);

        let state = ScannerState {
            provider,
            preferences,
            protocol: config.protocol.clone(),
            started: false,
            accessory_events: None,
            session: None,
            machine: MacBootstrap::new(),
            events: events.clone(),
            progress: progress.clone(),
        };
        tokio::spawn(run_scanner(state, request_rx));

        Self {
            request_tx,
            events,
            progress,
        }
    }

    /// Subscribe to discoveries and errors
    pub fn subscribe(&self) -> broadcast::Receiver<BootstrapEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BootstrapState {
        self.progress.borrow().clone()
    }

    /// Start waiting for the speaker. Completes immediately when both MACs are already stored.
    pub async fn start(&self) -> Result<()> {
        self.call(|reply| Request::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| Request::Stop { reply }).await
    }

    /// Wait until both addresses are known, or the bootstrap fails
    pub async fn wait_for_completion(&self) -> Result<(MacAddress, MacAddress)> {
        let mut rx = self.progress.subscribe();
        loop {
            let finished = match &*rx.borrow_and_update() {
                BootstrapState::Success {
                    host_mac,
                    device_mac,
                } => Some(Ok((*host_mac, *device_mac))),
                BootstrapState::Failed { response } => Some(Err(SpeakerError::UnexpectedResponse {
                    response: response.clone(),
                })),
                _ => None,
            };
            if let Some(result) = finished {
                return result;
            }
            rx.changed().await.map_err(|_| SpeakerError::ConnectionClosed)?;
        }
    }

    async fn call(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(build(tx))
            .map_err(|_| SpeakerError::ConnectionClosed)?;
        rx.await.map_err(|_| SpeakerError::ConnectionClosed)?
    }
}

async fn run_scanner(mut state: ScannerState, mut request_rx: mpsc::UnboundedReceiver<Request>) {
    loop {
        tokio::select! {
            request = request_rx.recv() => match request {
                Some(Request::Start { reply }) => {
                    let result = state.start().await;
                    let _ = reply.send(result);
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(state.stop());
                }
                None => break,
            },
            event = next_accessory_event(&mut state.accessory_events) => {
                state.handle_accessory_event(event).await;
            }
            event = next_session_event(&mut state.session) => {
                state.handle_session_event(event);
            }
        }
    }

    state.close_session();
}

async fn next_accessory_event(
    rx: &mut Option<broadcast::Receiver<AccessoryEvent>>,
) -> std::result::Result<AccessoryEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_session_event(session: &mut Option<ScannerSession>) -> ChannelEvent {
    match session {
        Some(session) => session.events.recv().await.unwrap_or(ChannelEvent::Closed),
        None => std::future::pending().await,
    }
}

impl ScannerState {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SpeakerError::AlreadyStarted);
        }
        self.started = true;

        if !needs_bootstrap(self.preferences.as_ref()) {
            let host_mac = stored_mac(self.preferences.host_mac(), "host MAC");
            let device_mac = stored_mac(self.preferences.device_mac(), "device MAC");
            if let (Some(host_mac), Some(device_mac)) = (host_mac, device_mac) {
                tracing::info!("Both MAC addresses already known, skipping bootstrap");
                self.progress.send_replace(BootstrapState::Success {
                    host_mac,
                    device_mac,
                });
                return Ok(());
            }
        }

        self.accessory_events = Some(self.provider.subscribe());
        for accessory in self.provider.connected_accessories() {
            self.bind(accessory).await;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(SpeakerError::NotStarted);
        }
        self.close_session();
        self.accessory_events = None;
        self.started = false;
        Ok(())
    }

    async fn handle_accessory_event(
        &mut self,
        event: std::result::Result<AccessoryEvent, broadcast::error::RecvError>,
    ) {
        match event {
            Ok(AccessoryEvent::Connected(accessory)) => self.bind(accessory).await,
            Ok(AccessoryEvent::Disconnected(id)) => {
                if self.session.as_ref().is_some_and(|s| s.accessory_id == id) {
                    self.close_session();
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} accessory notifications", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.accessory_events = None;
            }
        }
    }

    async fn bind(&mut self, accessory: Accessory) {
        if self.session.is_some()
            || self.machine.state() != &BootstrapState::Scanning
            || !accessory.supports(&self.protocol)
        {
            return;
        }

        let session = match self.provider.open_session(&accessory, &self.protocol).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Failed to open session on {}: {}", accessory.name, e);
                return;
            }
        };

        tracing::info!("Reading MAC addresses from {}", accessory.name);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.session = Some(ScannerSession {
            accessory_id: accessory.id,
            channel: Channel::open(session, Framing::Raw, events_tx),
            events: events_rx,
        });

        let actions = self.machine.on_session_opened();
        self.apply(actions);
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.channel.close();
        }
        self.machine.on_session_closed();
        self.publish();
    }

    fn handle_session_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Data(bytes) => {
                let actions = self.machine.on_bytes(&bytes);
                self.apply(actions);
            }
            ChannelEvent::Packet(packet) => {
                let actions = self.machine.on_bytes(packet.as_bytes());
                self.apply(actions);
            }
            ChannelEvent::Closed => self.close_session(),
        }
    }

    fn apply(&mut self, actions: Vec<BootstrapAction>) {
        for action in actions {
            match action {
                BootstrapAction::Send(packet) => {
                    if let Some(session) = &self.session {
                        if let Err(e) = session.channel.send(&packet) {
                            tracing::error!("Failed to send {}: {}", packet.to_hex(), e);
                        }
                    }
                }
                BootstrapAction::HostMacDiscovered(mac) => {
                    tracing::info!("Discovered host MAC: {}", mac);
                    if let Err(e) = self.preferences.set_host_mac(&mac.to_hex()) {
                        tracing::error!("Failed to store host MAC: {}", e);
                    }
                    let _ = self.events.send(BootstrapEvent::HostMacDiscovered(mac));
                }
                BootstrapAction::DeviceMacDiscovered(mac) => {
                    tracing::info!("Discovered device MAC: {}", mac);
                    if let Err(e) = self.preferences.set_device_mac(&mac.to_hex()) {
                        tracing::error!("Failed to store device MAC: {}", e);
                    }
                    let _ = self.events.send(BootstrapEvent::DeviceMacDiscovered(mac));
                }
                BootstrapAction::Failed { response } => {
                    let error = SpeakerError::UnexpectedResponse { response };
                    tracing::warn!("MAC bootstrap stopped: {}", error);
                    let _ = self.events.send(BootstrapEvent::Error(Arc::new(error)));
                }
            }
        }

        if self.machine.is_finished() {
            // Release the accessory so the classic connection can bind it.
            if let Some(session) = self.session.take() {
                session.channel.close();
            }
            self.accessory_events = None;
        }
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_if_modified(|current| {
            if current == self.machine.state() {
                false
            } else {
                *current = self.machine.state().clone();
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_RESPONSE: [u8; 9] = [0x08, 0x01, 0xAD, 0xcc, 0x2d, 0xb7, 0x48, 0xbc, 0x1e];
    const DEVICE_RESPONSE: [u8; 9] = [0x08, 0x01, 0xAF, 0xc0, 0x28, 0x8d, 0x02, 0x0f, 0x2b];

    #[test]
    fn test_session_open_queries_host_mac() {
        let mut machine = MacBootstrap::new();
        let actions = machine.on_session_opened();
        assert_eq!(
            actions,
            vec![BootstrapAction::Send(Packet::from_bytes(vec![0x02, 0x01, 0xAC]))]
        );
        assert_eq!(machine.state(), &BootstrapState::WaitingForHostMac);

        // A second session does not restart the exchange.
        assert!(machine.on_session_opened().is_empty());
    }

    #[test]
    fn test_host_mac_then_device_query_without_external_input() {
        let mut machine = MacBootstrap::new();
        machine.on_session_opened();

        assert!(machine.on_bytes(&HOST_RESPONSE[..4]).is_empty());
        let actions = machine.on_bytes(&HOST_RESPONSE[4..]);
        assert_eq!(
            actions,
            vec![
                BootstrapAction::HostMacDiscovered("cc2db748bc1e".parse().unwrap()),
                BootstrapAction::Send(Packet::from_bytes(vec![0x02, 0x01, 0xAE])),
            ]
        );
        assert_eq!(machine.state(), &BootstrapState::WaitingForDeviceMac);

        let actions = machine.on_bytes(&DEVICE_RESPONSE);
        assert_eq!(
            actions,
            vec![BootstrapAction::DeviceMacDiscovered("c0288d020f2b".parse().unwrap())]
        );
        assert_eq!(
            machine.state(),
            &BootstrapState::Success {
                host_mac: "cc2db748bc1e".parse().unwrap(),
                device_mac: "c0288d020f2b".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_overflow_fails_without_recovery() {
        let mut machine = MacBootstrap::new();
        machine.on_session_opened();

        let mut bytes = HOST_RESPONSE.to_vec();
        bytes.push(0xFF);
        let actions = machine.on_bytes(&bytes);
        assert_eq!(
            actions,
            vec![BootstrapAction::Failed {
                response: "0801adcc2db748bc1eff".to_string()
            }]
        );
        assert!(machine.is_finished());

        // Nothing moves the machine after a failure.
        assert!(machine.on_bytes(&DEVICE_RESPONSE).is_empty());
        machine.on_session_closed();
        assert!(matches!(machine.state(), BootstrapState::Failed { .. }));
    }

    #[test]
    fn test_bytes_before_session_are_ignored() {
        let mut machine = MacBootstrap::new();
        assert!(machine.on_bytes(&HOST_RESPONSE).is_empty());
        assert_eq!(machine.state(), &BootstrapState::Scanning);
    }

    #[test]
    fn test_disconnect_mid_exchange_starts_over() {
        let mut machine = MacBootstrap::new();
        machine.on_session_opened();
        machine.on_bytes(&HOST_RESPONSE);
        machine.on_bytes(&DEVICE_RESPONSE[..3]);

        machine.on_session_closed();
        assert_eq!(machine.state(), &BootstrapState::Scanning);

        machine.on_session_opened();
        let actions = machine.on_bytes(&HOST_RESPONSE);
        assert_eq!(actions.len(), 2);
    }
}
