//! Wire codec for the speaker's classic Bluetooth command set
//!
//! Every message is `[length][code MSB][code LSB][body...]` where `length`
//! counts the two code bytes plus the body. Nothing in here does I/O.

use crate::error::{Result, SpeakerError};
use crate::types::{MacAddress, MAC_ADDRESS_LEN};

/// Bytes preceding the body: length, code MSB, code LSB
pub const HEADER_LEN: usize = 3;

/// Largest body that still fits behind a one-byte length
pub const MAX_BODY_LEN: usize = u8::MAX as usize - 2;

/// Ack response byte meaning "ok"
pub const ACK_OK: u8 = 0x00;

/// Total size of a MAC address response packet
pub const MAC_RESPONSE_LEN: usize = HEADER_LEN + MAC_ADDRESS_LEN;

/// A single framed message, as sent to or received from the speaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    /// Wrap raw bytes without validating them
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Command code carried by the packet
    pub fn code(&self) -> Result<u16> {
        decode_code(self)
    }

    /// Bytes following the header (empty for short packets)
    pub fn body(&self) -> &[u8] {
        self.0.get(HEADER_LEN..).unwrap_or(&[])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// A command understood by the speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub code: u16,
    pub name: &'static str,
}

impl Command {
    pub const ACK: Command = Command::new(0, "ack");
    /// Ask for the Bluetooth MAC of the host (phone, tablet, computer)
    pub const QUERY_HOST_ADDRESS: Command = Command::new(428, "queryHostAddress");
    pub const RETURN_HOST_ADDRESS: Command = Command::new(429, "returnHostAddress");
    /// Ask for the speaker's own Bluetooth MAC
    pub const QUERY_DEVICE_ADDRESS: Command = Command::new(430, "queryDeviceAddress");
    pub const RETURN_DEVICE_ADDRESS: Command = Command::new(431, "returnDeviceAddress");
    /// Turn the speaker off
    pub const MASTER_REMOTE_OFF: Command = Command::new(438, "masterRemoteOff");

    /// Every command with a known meaning
    pub const ALL: [Command; 6] = [
        Command::ACK,
        Command::QUERY_HOST_ADDRESS,
        Command::RETURN_HOST_ADDRESS,
        Command::QUERY_DEVICE_ADDRESS,
        Command::RETURN_DEVICE_ADDRESS,
        Command::MASTER_REMOTE_OFF,
    ];

    pub const fn new(code: u16, name: &'static str) -> Self {
        Self { code, name }
    }

    /// Look up a known command by its code
    pub fn by_code(code: u16) -> Option<Command> {
        Self::ALL.iter().copied().find(|c| c.code == code)
    }

    pub fn msb(&self) -> u8 {
        (self.code >> 8) as u8
    }

    pub fn lsb(&self) -> u8 {
        (self.code & 0xFF) as u8
    }

    /// Encode the command with an optional body
    pub fn encode(&self, body: &[u8]) -> Result<Packet> {
        encode(*self, body)
    }

    /// Encode the command without a body
    ///
    /// An empty body always fits, so this cannot fail.
    pub fn packet(&self) -> Packet {
        Packet(vec![2, self.msb(), self.lsb()])
    }
}

/// Build `[len][codeMSB][codeLSB][body...]`
pub fn encode(command: Command, body: &[u8]) -> Result<Packet> {
    if body.len() > MAX_BODY_LEN {
        return Err(SpeakerError::PacketTooLarge {
            size: body.len(),
            max_size: MAX_BODY_LEN,
        });
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.push((body.len() + 2) as u8);
    bytes.push(command.msb());
    bytes.push(command.lsb());
    bytes.extend_from_slice(body);
    Ok(Packet(bytes))
}

/// Read the command code of a packet
pub fn decode_code(packet: &Packet) -> Result<u16> {
    let bytes = packet.as_bytes();
    if bytes.len() < HEADER_LEN {
        return Err(SpeakerError::MalformedPacket { len: bytes.len() });
    }
    Ok(u16::from_be_bytes([bytes[1], bytes[2]]))
}

/// Build the ack the speaker expects after one of its responses
///
/// Layout: `[0x05][ack MSB][ack LSB][acked MSB][acked LSB][ACK_OK]`.
pub fn build_ack(for_code: u16) -> Packet {
    let [msb, lsb] = for_code.to_be_bytes();
    let mut bytes = Command::ACK.packet().into_bytes();
    bytes[0] = 5;
    bytes.extend_from_slice(&[msb, lsb, ACK_OK]);
    Packet(bytes)
}

/// Extract the MAC address from a `return*Address` response
///
/// The response is exactly 9 bytes; the leading 3 are header and the
/// trailing 6 are the address.
pub fn parse_mac_response(packet: &Packet) -> Result<MacAddress> {
    parse_mac_bytes(packet.as_bytes())
}

pub(crate) fn parse_mac_bytes(bytes: &[u8]) -> Result<MacAddress> {
    if bytes.len() != MAC_RESPONSE_LEN {
        return Err(SpeakerError::UnexpectedResponse {
            response: hex::encode(bytes),
        });
    }
    MacAddress::from_slice(&bytes[HEADER_LEN..])
}
