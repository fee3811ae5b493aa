use crate::accessory::AccessoryProvider;
use crate::config::SpeakerConfig;
use crate::connection::{ClassicConnection, ClassicEvent};
use crate::error::{Result, SpeakerError};
use crate::low_energy::{LowEnergyConnection, LowEnergyEvent};
use crate::preferences::PreferenceStore;
use crate::radio::BleCentral;
use crate::subscription::StateReceiver;
use crate::types::{MacAddress, SpeakerState};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Connection to a UE speaker over both of its transports
///
/// The speaker is reachable over classic Bluetooth while it is on and over BLE
/// while it is off. This reconciles the two into one [`SpeakerState`] and
/// routes each request to the transport that can serve it.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use ue_speaker_control::{AccessoryProvider, BleCentral, MemoryPreferences, SpeakerConfig, SpeakerConnection, SpeakerState};
/// # async fn example(accessories: Arc<dyn AccessoryProvider>, radio: Arc<dyn BleCentral>) -> ue_speaker_control::Result<()> {
/// let prefs = Arc::new(MemoryPreferences::with_macs("cc2db748bc1e", "c0288d020f2b"));
/// let speaker = SpeakerConnection::new(accessories, radio, prefs, SpeakerConfig::default());
/// speaker.connect().await?;
///
/// let mut states = speaker.subscribe_state();
/// while let Ok(state) = states.recv().await {
///     if state == SpeakerState::Off {
///         speaker.request_power_on().await?;
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct SpeakerConnection {
    classic: Arc<ClassicConnection>,
    low_energy: Arc<LowEnergyConnection>,
    state: Arc<watch::Sender<SpeakerState>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerConnection {
    /// Create the connection. Must be called inside a tokio runtime.
    pub fn new(
        accessories: Arc<dyn AccessoryProvider>,
        radio: Arc<dyn BleCentral>,
        preferences: Arc<dyn PreferenceStore>,
        config: SpeakerConfig,
    ) -> Self {
        let (state, _) = watch::channel(SpeakerState::Unknown);

        Self {
            classic: Arc::new(ClassicConnection::new(accessories, &config)),
            low_energy: Arc::new(LowEnergyConnection::new(radio, preferences, &config)),
            state: Arc::new(state),
            event_task: Mutex::new(None),
        }
    }

    /// Current speaker state
    pub fn state(&self) -> SpeakerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> StateReceiver {
        StateReceiver::new(self.state.subscribe())
    }

    /// Start both transports
    ///
    /// The state becomes [`SpeakerState::On`] once a classic session is bound
    /// and [`SpeakerState::Off`] once the speaker is found over BLE without one.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut event_task = self.event_task.lock().unwrap_or_else(PoisonError::into_inner);
            if event_task.is_some() {
                return Err(SpeakerError::AlreadyStarted);
            }

            // Subscribe before starting so no transport event is missed.
            let classic_events = self.classic.subscribe();
            let ble_events = self.low_energy.subscribe();
            *event_task = Some(tokio::spawn(run_events(
                self.classic.clone(),
                self.low_energy.clone(),
                self.state.clone(),
                classic_events,
                ble_events,
            )));
        }

        if let Err(e) = self.start_transports().await {
            tracing::error!("Failed to connect to speaker: {}", e);
            if let Some(task) = self.event_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start_transports(&self) -> Result<()> {
        self.classic.start().await?;
        if let Err(e) = self.low_energy.connect().await {
            if let Err(e) = self.classic.stop().await {
                tracing::debug!("Classic connection stop: {}", e);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop both transports and return to [`SpeakerState::Unknown`]
    pub async fn stop(&self) -> Result<()> {
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SpeakerError::NotStarted)?;
        task.abort();

        if let Err(e) = self.classic.stop().await {
            tracing::debug!("Classic connection stop: {}", e);
        }
        if let Err(e) = self.low_energy.stop().await {
            tracing::debug!("BLE connection stop: {}", e);
        }
        set_state(&self.state, SpeakerState::Unknown);
        Ok(())
    }

    /// Power the speaker on over BLE
    ///
    /// Only legal while off. The state moves to unknown before the write is
    /// issued; the classic session binding afterwards moves it to on.
    pub async fn request_power_on(&self) -> Result<()> {
        self.transition(SpeakerState::Off, SpeakerState::Unknown, "power on")?;
        self.low_energy.request_power_on().await
    }

    /// Power the speaker off over classic Bluetooth
    pub async fn request_power_off(&self) -> Result<()> {
        self.transition(SpeakerState::On, SpeakerState::Unknown, "power off")?;

        if let Err(e) = self.classic.request_power_off().await {
            // Nothing was sent; the session is still bound.
            self.state.send_if_modified(|state| {
                if *state == SpeakerState::Unknown && self.classic.is_connected() {
                    *state = SpeakerState::On;
                    true
                } else {
                    false
                }
            });
            return Err(e);
        }
        Ok(())
    }

    /// Ask the speaker for the host's MAC address
    pub async fn request_host_mac(&self) -> Result<MacAddress> {
        self.require(SpeakerState::On, "host MAC")?;
        self.classic.request_host_mac().await
    }

    /// Ask the speaker for its own MAC address
    pub async fn request_device_mac(&self) -> Result<MacAddress> {
        self.require(SpeakerState::On, "device MAC")?;
        self.classic.request_device_mac().await
    }

    fn require(&self, required: SpeakerState, request: &str) -> Result<()> {
        let actual = self.state();
        if actual != required {
            tracing::warn!("Can't request {} from a speaker that is {}", request, actual);
            return Err(SpeakerError::InvalidState { required, actual });
        }
        Ok(())
    }

    /// Check-and-set, so two concurrent requests can't both pass the guard
    fn transition(&self, required: SpeakerState, next: SpeakerState, request: &str) -> Result<()> {
        let mut actual = required;
        let accepted = self.state.send_if_modified(|state| {
            if *state == required {
                tracing::info!("Speaker state: {} -> {}", state, next);
                *state = next;
                true
            } else {
                actual = *state;
                false
            }
        });

        if !accepted {
            tracing::warn!("Can't request {} for a speaker that is {}", request, actual);
            return Err(SpeakerError::InvalidState { required, actual });
        }
        Ok(())
    }
}

impl Drop for SpeakerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

fn set_state(state: &watch::Sender<SpeakerState>, next: SpeakerState) {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        tracing::info!("Speaker state: {} -> {}", current, next);
        *current = next;
        true
    });
}

/// Consume transport events and drive the speaker state
async fn run_events(
    classic: Arc<ClassicConnection>,
    low_energy: Arc<LowEnergyConnection>,
    state: Arc<watch::Sender<SpeakerState>>,
    mut classic_events: broadcast::Receiver<ClassicEvent>,
    mut ble_events: broadcast::Receiver<LowEnergyEvent>,
) {
    loop {
        tokio::select! {
            event = classic_events.recv() => match event {
                Ok(ClassicEvent::Connected) => {
                    tracing::info!("Connected to speaker via Bluetooth classic");
                    set_state(&state, SpeakerState::On);
                }
                Ok(ClassicEvent::Disconnected) => {
                    tracing::info!("Disconnected from speaker via Bluetooth classic");
                    set_state(&state, SpeakerState::Unknown);
                    if let Err(e) = low_energy.rescan().await {
                        tracing::warn!("Failed to rescan for speaker via BLE: {}", e);
                    }
                }
                Ok(ClassicEvent::Error(e)) => {
                    tracing::error!("Classic bluetooth connection encountered error: {}", e);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} classic connection events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = ble_events.recv() => match event {
                Ok(LowEnergyEvent::Ready) => {
                    if classic.is_connected() {
                        tracing::debug!("Speaker found via BLE while a classic session is open");
                    } else {
                        set_state(&state, SpeakerState::Off);
                    }
                }
                Ok(LowEnergyEvent::Disconnected) => {
                    tracing::debug!("BLE peripheral went away");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} BLE connection events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("Speaker event task exited");
}
