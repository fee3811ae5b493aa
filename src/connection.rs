use crate::accessory::{AccessoryEvent, AccessoryProvider};
use crate::channel::{Channel, ChannelEvent, Framing};
use crate::config::SpeakerConfig;
use crate::error::{Result, SpeakerError};
use crate::protocol::{self, build_ack, Command, Packet};
use crate::types::{Accessory, AccessoryId, MacAddress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

/// Event emitted by the classic connection
#[derive(Debug, Clone)]
pub enum ClassicEvent {
    /// A session to the speaker was established
    Connected,
    /// The session to the speaker went away
    Disconnected,
    /// The speaker did something unexpected; the connection keeps running
    Error(Arc<SpeakerError>),
}

/// Message handled by the connection task
enum Request {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    QueryMac {
        query: Command,
        expected: Command,
        response: oneshot::Sender<MacAddress>,
        reply: oneshot::Sender<Result<()>>,
    },
    PowerOff {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A request waiting for its correlated response
struct PendingRequest {
    expected: u16,
    response: oneshot::Sender<MacAddress>,
}

struct ActiveSession {
    accessory_id: AccessoryId,
    channel: Channel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// State owned by the connection task
struct ConnectionState {
    provider: Arc<dyn AccessoryProvider>,
    protocol: String,
    started: bool,
    accessory_events: Option<broadcast::Receiver<AccessoryEvent>>,
    session: Option<ActiveSession>,
    /// Requests waiting for responses
    pending_requests: Vec<PendingRequest>,
    events: broadcast::Sender<ClassicEvent>,
    connected: Arc<AtomicBool>,
}

/// Classic Bluetooth connection to the speaker
///
/// Only reachable while the speaker is on. The connection binds the first
/// accessory that speaks the configured protocol and correlates the speaker's
/// MAC address responses with the requests that asked for them.
pub struct ClassicConnection {
    request_tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<ClassicEvent>,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl ClassicConnection {
    /// Create the connection and spawn its task. Must be called inside a tokio runtime.
    pub fn new(provider: Arc<dyn AccessoryProvider>, config: &SpeakerConfig) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let connected = Arc::new(AtomicBool::new(false));

        let state = ConnectionState {
            provider,
            protocol: config.protocol.clone(),
            started: false,
            accessory_events: None,
            session: None,
            pending_requests: Vec::new(),
            events: events.clone(),
            connected: connected.clone(),
        };
        tokio::spawn(run_connection(state, request_rx));

        Self {
            request_tx,
            events,
            connected,
            request_timeout: config.request_timeout,
        }
    }

    /// Subscribe to connect/disconnect/error events
    pub fn subscribe(&self) -> broadcast::Receiver<ClassicEvent> {
        self.events.subscribe()
    }

    /// Whether a session to the speaker is currently open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Start watching for the speaker's accessory
    pub async fn start(&self) -> Result<()> {
        self.call(|reply| Request::Start { reply }).await
    }

    /// Close any session and stop watching for accessories
    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| Request::Stop { reply }).await
    }

    /// Ask the speaker for the host's Bluetooth MAC address
    pub async fn request_host_mac(&self) -> Result<MacAddress> {
        self.request_mac(Command::QUERY_HOST_ADDRESS, Command::RETURN_HOST_ADDRESS)
            .await
    }

    /// Ask the speaker for its own Bluetooth MAC address
    pub async fn request_device_mac(&self) -> Result<MacAddress> {
        self.request_mac(Command::QUERY_DEVICE_ADDRESS, Command::RETURN_DEVICE_ADDRESS)
            .await
    }

    /// Tell the speaker to power off (fire and forget)
    pub async fn request_power_off(&self) -> Result<()> {
        self.call(|reply| Request::PowerOff { reply }).await
    }

    async fn request_mac(&self, query: Command, expected: Command) -> Result<MacAddress> {
        let (response_tx, response_rx) = oneshot::channel();
        self.call(|reply| Request::QueryMac {
            query,
            expected,
            response: response_tx,
            reply,
        })
        .await?;

        // The task keeps no timer; abandoned entries are pruned on the next request.
        match timeout(self.request_timeout, response_rx).await {
            Ok(Ok(mac)) => Ok(mac),
            Ok(Err(_)) => Err(SpeakerError::RequestCancelled),
            Err(_) => Err(SpeakerError::Timeout),
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(build(tx))
            .map_err(|_| SpeakerError::ConnectionClosed)?;
        rx.await.map_err(|_| SpeakerError::ConnectionClosed)?
    }
}

async fn run_connection(mut state: ConnectionState, mut request_rx: mpsc::UnboundedReceiver<Request>) {
    loop {
        tokio::select! {
            request = request_rx.recv() => match request {
                Some(request) => state.handle_request(request).await,
                None => break,
            },
            event = next_accessory_event(&mut state.accessory_events) => {
                state.handle_accessory_event(event).await;
            }
            event = next_channel_event(&mut state.session) => {
                state.handle_channel_event(event);
            }
        }
    }

    // Owner dropped, cancel all pending requests
    state.close_session();
    tracing::debug!("Classic connection task exited");
}

async fn next_accessory_event(
    rx: &mut Option<broadcast::Receiver<AccessoryEvent>>,
) -> std::result::Result<AccessoryEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_channel_event(session: &mut Option<ActiveSession>) -> ChannelEvent {
    match session {
        Some(session) => session.events.recv().await.unwrap_or(ChannelEvent::Closed),
        None => std::future::pending().await,
    }
}

impl ConnectionState {
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Request::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            Request::QueryMac {
                query,
                expected,
                response,
                reply,
            } => {
                let _ = reply.send(self.query_mac(query, expected, response));
            }
            Request::PowerOff { reply } => {
                let result = self.send(&Command::MASTER_REMOTE_OFF.packet());
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SpeakerError::AlreadyStarted);
        }
        self.started = true;
        self.accessory_events = Some(self.provider.subscribe());

        // Capture already-connected accessories.
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

    fn query_mac(
        &mut self,
        query: Command,
        expected: Command,
        response: oneshot::Sender<MacAddress>,
    ) -> Result<()> {
        self.send(&query.packet())?;
        self.pending_requests.retain(|p| !p.response.is_closed());
        self.pending_requests.push(PendingRequest {
            expected: expected.code,
            response,
        });
        Ok(())
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        let session = self.session.as_ref().ok_or(SpeakerError::NotConnected)?;
        session.channel.send(packet)
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
                tracing::warn!("Accessory notifications ended");
                self.accessory_events = None;
            }
        }
    }

    /// Open a session on the accessory if it is the speaker and none is active
    async fn bind(&mut self, accessory: Accessory) {
        if self.session.is_some() || !accessory.supports(&self.protocol) {
            tracing::debug!("Ignoring accessory {} ({})", accessory.name, accessory.id);
            return;
        }

        let session = match self.provider.open_session(&accessory, &self.protocol).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Failed to open session on {}: {}", accessory.name, e);
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.session = Some(ActiveSession {
            accessory_id: accessory.id,
            channel: Channel::open(session, Framing::Packets, events_tx),
            events: events_rx,
        });
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!("Connected to {} via Bluetooth classic", accessory.name);
        let _ = self.events.send(ClassicEvent::Connected);
    }

    fn close_session(&mut self) {
        self.pending_requests.clear();

        if let Some(session) = self.session.take() {
            session.channel.close();
            self.connected.store(false, Ordering::SeqCst);

            tracing::info!("Disconnected from accessory {}", session.accessory_id);
            let _ = self.events.send(ClassicEvent::Disconnected);
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Packet(packet) => self.handle_packet(packet),
            ChannelEvent::Data(bytes) => {
                tracing::debug!("Ignoring unframed bytes: {}", hex::encode(bytes));
            }
            ChannelEvent::Closed => self.close_session(),
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        tracing::debug!("Received classic packet: {}", packet.to_hex());

        let code = match packet.code() {
            Ok(code) => code,
            Err(e) => {
                tracing::trace!("Dropping packet: {}", e);
                return;
            }
        };

        if code != Command::RETURN_HOST_ADDRESS.code && code != Command::RETURN_DEVICE_ADDRESS.code {
            tracing::debug!("Ignoring packet with code {}", code);
            return;
        }

        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_requests)
            .into_iter()
            .partition(|p| p.expected == code);
        self.pending_requests = rest;

        match protocol::parse_mac_response(&packet) {
            Ok(mac) => {
                for pending in matching {
                    let _ = pending.response.send(mac);
                }
                // Mimics the vendor app; the speaker does not seem to require it.
                if let Err(e) = self.send(&build_ack(code)) {
                    tracing::warn!("Failed to ack packet {}: {}", code, e);
                }
            }
            Err(e) => {
                tracing::warn!("{}", e);
                let _ = self.events.send(ClassicEvent::Error(Arc::new(e)));
            }
        }
    }
}
