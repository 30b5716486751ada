//! Socket driver for one secure channel.
//!
//! Bridges a [`Channel`] to a tokio [`TcpStream`] without ever blocking on
//! the network: each [`PeerConn::step`] call drains whatever bytes are
//! currently available (or polls a send-only stage), feeds the state machine
//! one event, and applies the resulting effects. A zero-byte read means the
//! peer closed the connection and is handled like any other connection-level
//! failure: log and disconnect.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::channel::{Channel, Effect, Event, Stage};

const READ_CHUNK: usize = 1024;

/// One live peer connection: a socket plus its channel state machine.
pub struct PeerConn {
    stream: TcpStream,
    addr: SocketAddr,
    channel: Channel,
    last_activity: Instant,
    connected: bool,
}

impl PeerConn {
    /// Wrap an accepted or freshly connected socket.
    pub fn new(stream: TcpStream, addr: SocketAddr, channel: Channel) -> Self {
        Self {
            stream,
            addr,
            channel,
            last_activity: Instant::now(),
            connected: true,
        }
    }

    /// Remote address, for diagnostics.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Peer identity once the handshake has exchanged it.
    pub fn peer_id(&self) -> Option<&str> {
        self.channel.peer_id()
    }

    /// True when the channel has a buffered replication batch.
    pub fn has_data(&self) -> bool {
        self.channel.stage() == Stage::HasData
    }

    /// True once this connection can be dropped from the queue.
    pub fn finished(&self) -> bool {
        self.channel.stage() == Stage::Closed
    }

    /// Take the buffered batch together with the sender's identity.
    pub fn take_received(&mut self) -> Option<(String, Vec<u8>)> {
        let peer = self.channel.peer_id()?.to_string();
        let data = self.channel.take_received()?;
        Some((peer, data))
    }

    /// Advance the connection at most one state-machine step.
    ///
    /// `stale_after` bounds how long a connection may sit without making
    /// progress; a stalled handshake is disconnected rather than pinning the
    /// slot forever.
    pub async fn step(&mut self, stale_after: Duration) {
        if self.channel.is_terminal() {
            return;
        }

        let event = if self.channel.wants_input() {
            match self.drain() {
                ReadOutcome::Data(buf) => Event::Data(buf),
                ReadOutcome::Empty => {
                    if self.last_activity.elapsed() > stale_after {
                        info!(addr = %self.addr, "connection made no progress, dropping");
                        self.disconnect().await;
                    }
                    return;
                }
                ReadOutcome::Lost => {
                    info!(
                        addr = %self.addr,
                        peer = self.channel.peer_id().unwrap_or("?"),
                        "connection lost"
                    );
                    self.disconnect().await;
                    return;
                }
            }
        } else {
            Event::Poll
        };

        self.last_activity = Instant::now();
        for effect in self.channel.on_event(event) {
            match effect {
                Effect::Send(bytes) => {
                    if let Err(e) = self.stream.write_all(&bytes).await {
                        debug!(addr = %self.addr, error = %e, "write failed");
                        self.disconnect().await;
                        return;
                    }
                }
                Effect::Disconnect => {
                    self.shutdown_socket().await;
                }
            }
        }
    }

    /// Drain all currently available bytes without blocking.
    fn drain(&mut self) -> ReadOutcome {
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return ReadOutcome::Lost,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "read failed");
                    return ReadOutcome::Lost;
                }
            }
        }
        if buf.is_empty() {
            ReadOutcome::Empty
        } else {
            ReadOutcome::Data(buf)
        }
    }

    async fn disconnect(&mut self) {
        self.channel.close();
        self.shutdown_socket().await;
    }

    async fn shutdown_socket(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.stream.shutdown().await;
        }
    }
}

enum ReadOutcome {
    /// Bytes were available and have been drained.
    Data(Vec<u8>),
    /// Nothing to read right now.
    Empty,
    /// Zero-byte read or hard I/O error: the peer is gone.
    Lost,
}
