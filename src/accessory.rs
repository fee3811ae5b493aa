//! Accessory/session provider capability
//!
//! The operating system owns accessory discovery and session setup. The
//! classic connection and the MAC bootstrap scanner only need the narrow
//! surface below.

use crate::error::Result;
use crate::types::{Accessory, AccessoryId};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// A bidirectional byte stream to one accessory
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed session stream handed out by an [`AccessoryProvider`]
pub type Session = Box<dyn SessionStream>;

/// Accessory connect/disconnect notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryEvent {
    Connected(Accessory),
    Disconnected(AccessoryId),
}

/// Source of external accessories and their byte sessions
#[async_trait]
pub trait AccessoryProvider: Send + Sync {
    /// Accessories that are connected right now
    fn connected_accessories(&self) -> Vec<Accessory>;

    /// Subscribe to connect/disconnect notifications
    fn subscribe(&self) -> broadcast::Receiver<AccessoryEvent>;

    /// Open a byte session speaking `protocol` on the given accessory
    async fn open_session(&self, accessory: &Accessory, protocol: &str) -> Result<Session>;
}
