use crate::error::{Result, SpeakerError};
use crate::types::SpeakerState;
use tokio::sync::watch;

/// Receiver for speaker state changes
///
/// Only the latest state is kept; a slow receiver sees the most recent value
/// rather than every intermediate transition.
pub struct StateReceiver {
    rx: watch::Receiver<SpeakerState>,
}

impl StateReceiver {
    pub(crate) fn new(rx: watch::Receiver<SpeakerState>) -> Self {
        Self { rx }
    }

    /// The state as of now, without waiting
    pub fn current(&self) -> SpeakerState {
        *self.rx.borrow()
    }

    /// Wait for the next state change
    ///
    /// Returns [`SpeakerError::ConnectionClosed`] once the speaker connection is gone.
    pub async fn recv(&mut self) -> Result<SpeakerState> {
        self.rx
            .changed()
            .await
            .map_err(|_| SpeakerError::ConnectionClosed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Take a state change if one happened since the last receive
    pub fn try_recv(&mut self) -> Result<Option<SpeakerState>> {
        match self.rx.has_changed() {
            Ok(true) => Ok(Some(*self.rx.borrow_and_update())),
            Ok(false) => Ok(None),
            Err(_) => Err(SpeakerError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receives_latest_state() {
        let (tx, rx) = watch::channel(SpeakerState::Unknown);
        let mut receiver = StateReceiver::new(rx);
        assert_eq!(receiver.try_recv().unwrap(), None);

        tx.send_replace(SpeakerState::Off);
        tx.send_replace(SpeakerState::On);
        assert_eq!(receiver.recv().await.unwrap(), SpeakerState::On);
        assert_eq!(receiver.current(), SpeakerState::On);
        assert_eq!(receiver.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_when_sender_dropped() {
        let (tx, rx) = watch::channel(SpeakerState::Unknown);
        let mut receiver = StateReceiver::new(rx);
        drop(tx);
        assert!(matches!(receiver.recv().await, Err(SpeakerError::ConnectionClosed)));
        assert!(matches!(receiver.try_recv(), Err(SpeakerError::ConnectionClosed)));
    }
}
