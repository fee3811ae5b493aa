use crate::error::{Result, SpeakerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Accessory identifier assigned by the accessory provider
pub type AccessoryId = u64;

/// Number of bytes in a Bluetooth MAC address
pub const MAC_ADDRESS_LEN: usize = 6;

/// Power state of the speaker as seen through its two transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerState {
    /// Reachable over classic Bluetooth
    On,
    /// Reachable over BLE
    Off,
    /// Initial state, and the state while a power transition is in flight
    #[default]
    Unknown,
}

impl SpeakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerState::On => "on",
            SpeakerState::Off => "off",
            SpeakerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SpeakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 6-byte Bluetooth MAC address
///
/// Rendered as lowercase hex without separators (`c0288d020f2b`), which is the
/// form the preference store and the speaker's advertisements use. Parsing
/// accepts either case and ignores `:` and `-` separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    pub const fn new(bytes: [u8; MAC_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an address from a slice that must be exactly 6 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; MAC_ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| SpeakerError::InvalidMacAddress(hex::encode(bytes)))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; MAC_ADDRESS_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for MacAddress {
    type Err = SpeakerError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes =
            hex::decode(&digits).map_err(|_| SpeakerError::InvalidMacAddress(s.to_string()))?;
        Self::from_slice(&bytes).map_err(|_| SpeakerError::InvalidMacAddress(s.to_string()))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An external accessory as reported by the accessory provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessory {
    pub id: AccessoryId,
    pub name: String,

    /// Protocol strings the accessory declares (e.g. "com.logitech.ue.ueroll")
    pub protocol_strings: Vec<String>,
}

impl Accessory {
    /// Check whether the accessory speaks the given protocol
    pub fn supports(&self, protocol: &str) -> bool {
        self.protocol_strings.iter().any(|p| p == protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_parse_and_render() {
        let mac: MacAddress = "C0:28:8D:02:0F:2B".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xc0, 0x28, 0x8d, 0x02, 0x0f, 0x2b]);
        assert_eq!(mac.to_string(), "c0288d020f2b");

        let same: MacAddress = "c0288d020f2b".parse().unwrap();
        assert_eq!(mac, same);
    }

    #[test]
    fn test_mac_address_rejects_bad_input() {
        assert!("c0288d020f".parse::<MacAddress>().is_err());
        assert!("c0288d020f2b01".parse::<MacAddress>().is_err());
        assert!("zz288d020f2b".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_address_serde_as_hex_string() {
        let mac = MacAddress::new([0xcc, 0x2d, 0xb7, 0x48, 0xbc, 0x1e]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"cc2db748bc1e\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_speaker_state_names() {
        assert_eq!(SpeakerState::default(), SpeakerState::Unknown);
        assert_eq!(SpeakerState::On.to_string(), "on");
        assert_eq!(serde_json::to_string(&SpeakerState::Off).unwrap(), "\"off\"");
    }

    #[test]
    fn test_accessory_supports_protocol() {
        let accessory = Accessory {
            id: 1,
            name: "UE ROLL".to_string(),
            protocol_strings: vec!["com.logitech.ue.ueroll".to_string()],
        };
        assert!(accessory.supports("com.logitech.ue.ueroll"));
        assert!(!accessory.supports("com.example.other"));
    }
}
