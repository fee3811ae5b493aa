//! Rust library for powering Ultimate Ears speakers on and off
//!
//! A UE speaker exposes two faces over Bluetooth. While it is on it is an
//! external accessory speaking a small length-prefixed command protocol over
//! classic Bluetooth. While it is off only its BLE peripheral remains, and
//! writing the host's MAC address to a vendor characteristic wakes it up.
//! This library drives both and reconciles them into one on/off/unknown state:
//!
//! - Classic Bluetooth framing and command codec
//! - Host and speaker MAC address queries, power off
//! - BLE discovery by advertised MAC, power on
//! - One-time MAC address bootstrap with persisted preferences
//! - Real-time state subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ue_speaker_control::{
//!     AccessoryProvider, BleCentral, JsonFilePreferences, MacAddressScanner, SpeakerConfig,
//!     SpeakerConnection, SpeakerState, needs_bootstrap,
//! };
//!
//! async fn toggle(
//!     accessories: Arc<dyn AccessoryProvider>,
//!     radio: Arc<dyn BleCentral>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SpeakerConfig::default();
//!     let prefs = Arc::new(JsonFilePreferences::open("ue-speaker.json")?);
//!
//!     // Learn the MAC addresses once, while the speaker is on
//!     if needs_bootstrap(prefs.as_ref()) {
//!         let scanner = MacAddressScanner::new(accessories.clone(), prefs.clone(), &config);
//!         scanner.start().await?;
//!         let (host, device) = scanner.wait_for_completion().await?;
//!         println!("host {} speaker {}", host, device);
//!         scanner.stop().await?;
//!     }
//!
//!     let speaker = SpeakerConnection::new(accessories, radio, prefs, config);
//!     speaker.connect().await?;
//!
//!     let mut states = speaker.subscribe_state();
//!     loop {
//!         match states.recv().await? {
//!             SpeakerState::On => {
//!                 speaker.request_power_off().await?;
//!                 break;
//!             }
//!             SpeakerState::Off => {
//!                 speaker.request_power_on().await?;
//!                 break;
//!             }
//!             SpeakerState::Unknown => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **SpeakerConnection**: State reconciliation and request routing
//! - **Classic / LowEnergy connections**: One per transport, each a tokio task
//! - **Bootstrap**: MAC address discovery over classic Bluetooth
//! - **Channel**: Byte session I/O and packet framing
//! - **Protocol**: Classic command codes and packet layout
//! - **Accessory / Radio / Preferences**: Platform capabilities the core calls into

mod accessory;
mod bootstrap;
mod channel;
mod config;
mod connection;
mod error;
mod low_energy;
mod preferences;
mod protocol;
mod radio;
mod speaker_connection;
mod subscription;
mod types;

// Public exports
pub use accessory::{AccessoryEvent, AccessoryProvider, Session, SessionStream};
pub use bootstrap::{BootstrapAction, BootstrapEvent, BootstrapState, MacAddressScanner, MacBootstrap};
pub use channel::{Channel, ChannelEvent, Framing, PacketFramer};
pub use config::{characteristics, services, SpeakerConfig, UE_ROLL_PROTOCOL};
pub use connection::{ClassicConnection, ClassicEvent};
pub use error::{Result, SpeakerError};
pub use low_energy::{power_on_payload, LowEnergyConnection, LowEnergyEvent, PeripheralHandle, POWER_ON_PAD};
pub use preferences::{needs_bootstrap, JsonFilePreferences, MemoryPreferences, PreferenceStore};
pub use protocol::{
    build_ack, decode_code, encode, parse_mac_response, Command, Packet, ACK_OK, HEADER_LEN,
    MAC_RESPONSE_LEN, MAX_BODY_LEN,
};
pub use radio::{BleCentral, GattCharacteristic, PeripheralId, RadioEvent, WriteType};
#[cfg(feature = "btleplug")]
pub use radio::BtleplugCentral;
pub use speaker_connection::SpeakerConnection;
pub use subscription::StateReceiver;
pub use types::{Accessory, AccessoryId, MacAddress, SpeakerState, MAC_ADDRESS_LEN};
