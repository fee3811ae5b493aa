use crate::types::SpeakerState;
use thiserror::Error;

/// Result type for speaker operations
pub type Result<T> = std::result::Result<T, SpeakerError>;

/// Errors that can occur when talking to a UE speaker
#[derive(Error, Debug)]
pub enum SpeakerError {
    /// `start()` was called on a component that is already running
    #[error("Already started, can't start again")]
    AlreadyStarted,

    /// `stop()` was called on a component that was never started
    #[error("Not started, can't stop")]
    NotStarted,

    /// No session or peripheral is available for the request
    #[error("Not connected to the speaker")]
    NotConnected,

    /// The speaker answered with a response of the wrong shape
    #[error("Received unexpected response from speaker: {response}")]
    UnexpectedResponse {
        /// Hex dump of the offending bytes
        response: String,
    },

    /// A packet was too short to carry a command code
    #[error("Malformed packet of {len} bytes")]
    MalformedPacket {
        /// Number of bytes in the packet
        len: usize,
    },

    /// A command body does not fit in a single packet
    #[error("Packet too large: {size} bytes (max: {max_size})")]
    PacketTooLarge { size: usize, max_size: usize },

    /// A MAC address string could not be parsed
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    /// A required preference slot is empty
    #[error("Missing preference: {0}")]
    MissingPreference(&'static str),

    /// The request is not legal in the speaker's current state
    #[error("Speaker must be {required} for this request but is {actual}")]
    InvalidState {
        required: SpeakerState,
        actual: SpeakerState,
    },

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// The pending request was dropped before a response arrived
    #[error("Request cancelled")]
    RequestCancelled,

    /// The component's task has shut down
    #[error("Connection closed")]
    ConnectionClosed,

    /// BLE radio error
    #[error("BLE error: {0}")]
    Ble(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for SpeakerError {
    fn from(err: btleplug::Error) -> Self {
        SpeakerError::Ble(err.to_string())
    }
}
