//! Byte channel over one accessory session
//!
//! A [`Channel`] owns the session stream inside a dedicated task. Writes are
//! queued without blocking and drained whenever the stream accepts bytes;
//! reads are cut into packets by [`PacketFramer`] and handed to the owner in
//! arrival order.

use crate::accessory::Session;
use crate::error::{Result, SpeakerError};
use crate::protocol::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 256;

/// Splits a byte stream into length-prefixed packets
///
/// The first buffered byte is the length of what follows. A packet is only
/// emitted once all of its bytes have arrived.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: Vec<u8>,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every packet that is now complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(bytes);

        let mut packets = Vec::new();
        while let Some(&length) = self.buffer.first() {
            let total = length as usize + 1;
            if self.buffer.len() < total {
                break;
            }
            packets.push(Packet::from_bytes(self.buffer.drain(..total).collect::<Vec<u8>>()));
        }
        packets
    }

    /// Number of bytes waiting for the rest of their packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// How inbound bytes are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Complete length-prefixed packets
    Packets,
    /// Raw chunks as they were read
    Raw,
}

/// Inbound notification from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Packet(Packet),
    Data(Vec<u8>),
    /// The session hit end of stream or a read error
    Closed,
}

enum ChannelCommand {
    Write(Vec<u8>),
    Close,
}

/// Duplex byte channel over one session
pub struct Channel {
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl Channel {
    /// Take ownership of the session and start pumping bytes
    ///
    /// Inbound packets (or raw chunks) and the final `Closed` notification are
    /// sent to `events`.
    pub fn open(
        session: Session,
        framing: Framing,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(session, framing, command_rx, events));
        Self { command_tx }
    }

    /// Queue bytes for transmission
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.command_tx
            .send(ChannelCommand::Write(bytes.into()))
            .map_err(|_| SpeakerError::ConnectionClosed)
    }

    /// Queue a packet for transmission
    pub fn send(&self, packet: &Packet) -> Result<()> {
        tracing::debug!("Sending packet: {}", packet.to_hex());
        self.write(packet.as_bytes())
    }

    /// Close both directions of the session. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.command_tx.send(ChannelCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel(
    session: Session,
    framing: Framing,
    mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let (mut reader, mut writer) = tokio::io::split(session);
    let mut framer = PacketFramer::new();
    let mut read_buf = [0u8; READ_CHUNK];
    let mut write_buffer: Vec<u8> = Vec::new();
    // Set after a failed write; cleared when new bytes are queued.
    let mut write_stalled = false;

    loop {
        let can_write = !write_buffer.is_empty() && !write_stalled;

        tokio::select! {
            command = command_rx.recv() => match command {
                Some(ChannelCommand::Write(bytes)) => {
                    write_buffer.extend_from_slice(&bytes);
                    write_stalled = false;
                }
                Some(ChannelCommand::Close) | None => break,
            },
            read = reader.read(&mut read_buf) => match read {
                Ok(0) => {
                    tracing::debug!("Session reached end of stream");
                    let _ = events.send(ChannelEvent::Closed);
                    break;
                }
                Ok(n) => {
                    let chunk = &read_buf[..n];
                    tracing::trace!("Read {} bytes: {}", n, hex::encode(chunk));
                    match framing {
                        Framing::Packets => {
                            for packet in framer.push(chunk) {
                                let _ = events.send(ChannelEvent::Packet(packet));
                            }
                        }
                        Framing::Raw => {
                            let _ = events.send(ChannelEvent::Data(chunk.to_vec()));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Error reading from session: {}", e);
                    let _ = events.send(ChannelEvent::Closed);
                    break;
                }
            },
            written = writer.write(&write_buffer), if can_write => match written {
                Ok(n) => {
                    write_buffer.drain(..n);
                    if write_buffer.is_empty() {
                        if let Err(e) = writer.flush().await {
                            tracing::error!("Error flushing session: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Error writing to session: {}", e);
                    write_stalled = true;
                }
            },
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Error shutting down session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::duplex;

    fn packet(code: u16, body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![(body.len() + 2) as u8];
        bytes.extend_from_slice(&code.to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_framer_waits_for_complete_packet() {
        let mut framer = PacketFramer::new();
        assert!(framer.push(&[0x08, 0x01]).is_empty());
        assert!(framer.push(&[0xAD, 0xcc, 0x2d]).is_empty());
        assert_eq!(framer.buffered(), 5);

        let packets = framer.push(&[0xb7, 0x48, 0xbc, 0x1e, 0x02]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_bytes().len(), 9);
        // Start of the next packet stays buffered.
        assert_eq!(framer.buffered(), 1);
    }

    #[test]
    fn test_framer_emits_several_packets_from_one_chunk() {
        let mut framer = PacketFramer::new();
        let mut bytes = packet(438, &[]);
        bytes.extend(packet(0, &[0x01, 0xAD, 0x00]));
        let packets = framer.push(&bytes);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].code().unwrap(), 438);
        assert_eq!(packets[1].code().unwrap(), 0);
        assert_eq!(framer.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_framing_ignores_chunk_boundaries(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 1..8),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let expected: Vec<Vec<u8>> = bodies.iter().map(|b| packet(0x01AD, b)).collect();
            let stream: Vec<u8> = expected.concat();

            let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut framer = PacketFramer::new();
            let mut got = Vec::new();
            for pair in points.windows(2) {
                got.extend(framer.push(&stream[pair[0]..pair[1]]).into_iter().map(Packet::into_bytes));
            }

            prop_assert_eq!(got, expected);
            prop_assert_eq!(framer.buffered(), 0);
        }
    }

    #[tokio::test]
    async fn test_channel_delivers_packets_in_order() {
        let (local, mut remote) = duplex(64);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _channel = Channel::open(Box::new(local), Framing::Packets, events_tx);

        remote.write_all(&[0x02, 0x01, 0xB6, 0x02]).await.unwrap();
        remote.write_all(&[0x01, 0xAC]).await.unwrap();

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert_eq!(first, ChannelEvent::Packet(Packet::from_bytes(vec![0x02, 0x01, 0xB6])));
        assert_eq!(second, ChannelEvent::Packet(Packet::from_bytes(vec![0x02, 0x01, 0xAC])));
    }

    #[tokio::test]
    async fn test_channel_writes_queued_bytes_in_order() {
        let (local, mut remote) = duplex(4);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let channel = Channel::open(Box::new(local), Framing::Packets, events_tx);

        channel.write(vec![1, 2, 3]).unwrap();
        channel.write(vec![4, 5, 6, 7, 8]).unwrap();

        let mut received = [0u8; 8];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_channel_reports_end_of_stream() {
        let (local, remote) = duplex(16);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = Channel::open(Box::new(local), Framing::Raw, events_tx);

        drop(remote);
        assert_eq!(events_rx.recv().await, Some(ChannelEvent::Closed));

        // Closing after the task has exited is harmless.
        channel.close();
        channel.close();
    }

    #[tokio::test]
    async fn test_raw_channel_passes_chunks_through() {
        let (local, mut remote) = duplex(16);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _channel = Channel::open(Box::new(local), Framing::Raw, events_tx);

        remote.write_all(&[0x08, 0x01]).await.unwrap();
        match events_rx.recv().await {
            Some(ChannelEvent::Data(bytes)) => assert_eq!(bytes, vec![0x08, 0x01]),
            other => panic!("expected raw data, got {:?}", other),
        }
    }
}
