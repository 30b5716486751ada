//! Connection queue: listener, live connections, and peer roster.
//!
//! Owns every active [`PeerConn`] and the listening socket. One
//! [`ConnectionQueue::service_once`] call accepts any pending connections,
//! advances every channel a single step, harvests fully received batches
//! into an inbound queue, and reaps finished connections. Nothing here
//! blocks on the network; the orchestrator calls `service_once` from its
//! polling loop.

use std::collections::VecDeque;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::conn::PeerConn;
use super::crypto::KEY_LEN;

/// A known peer: identity string plus where to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// Peer identity, e.g. `sv2`.
    pub identity: String,
    /// Peer host address.
    pub addr: String,
    /// Peer listening port.
    pub port: u16,
}

/// Manages the listening socket and all per-peer connections.
pub struct ConnectionQueue {
    listener: Option<TcpListener>,
    conns: Vec<PeerConn>,
    inbound: VecDeque<(String, Vec<u8>)>,
    peers: Vec<PeerEntry>,
    self_identity: String,
    key: [u8; KEY_LEN],
    connect_timeout: Duration,
    stale_after: Duration,
}

impl ConnectionQueue {
    /// Create a queue for `self_identity` with a static peer roster.
    pub fn new(
        self_identity: &str,
        key: [u8; KEY_LEN],
        peers: Vec<PeerEntry>,
        connect_timeout: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            listener: None,
            conns: Vec::new(),
            inbound: VecDeque::new(),
            peers,
            self_identity: self_identity.to_string(),
            key,
            connect_timeout,
            stale_after,
        }
    }

    /// Bind the listening socket.
    pub async fn bind(&mut self, addr: &str, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind((addr, port)).await?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Port actually bound, useful when binding port 0.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// This node's identity string.
    pub fn self_identity(&self) -> &str {
        &self.self_identity
    }

    /// The static peer roster.
    pub fn known_peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    /// Number of currently live connections.
    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// One service pass: accept, step every connection once, harvest
    /// received batches, reap finished connections.
    pub async fn service_once(&mut self) {
        self.accept_pending();

        for conn in &mut self.conns {
            conn.step(self.stale_after).await;
        }

        for conn in &mut self.conns {
            if conn.has_data() {
                if let Some((peer, data)) = conn.take_received() {
                    debug!(peer = %peer, bytes = data.len(), "batch ready for ingest");
                    self.inbound.push_back((peer, data));
                }
            }
        }

        self.conns.retain(|c| !c.finished());
    }

    /// Pop one fully received inbound batch, if any.
    pub fn pop(&mut self) -> Option<(String, Vec<u8>)> {
        self.inbound.pop_front()
    }

    /// Open an initiator connection to every known peer carrying `batch`.
    /// Per-peer connect failures are logged and skipped; the next
    /// replication burst will try again.
    pub async fn broadcast(&mut self, batch: &[u8]) {
        for peer in self.peers.clone() {
            let target = format!("{}:{}", peer.addr, peer.port);
            let connect = TcpStream::connect(&*target);
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => {
                    let addr = match stream.peer_addr() {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(peer = %peer.identity, error = %e, "connection unusable");
                            continue;
                        }
                    };
                    let channel = Channel::initiate(self.key, &self.self_identity, batch);
                    self.conns.push(PeerConn::new(stream, addr, channel));
                    debug!(peer = %peer.identity, addr = %target, "replication connection opened");
                }
                Ok(Err(e)) => {
                    info!(peer = %peer.identity, addr = %target, error = %e, "connect failed");
                }
                Err(_) => {
                    info!(peer = %peer.identity, addr = %target, "connect timed out");
                }
            }
        }
    }

    /// Accept every connection currently pending on the listener without
    /// waiting for new ones.
    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        while let Some(result) = listener.accept().now_or_never() {
            match result {
                Ok((stream, addr)) => {
                    let channel = Channel::accept(self.key, &self.self_identity);
                    self.conns.push(PeerConn::new(stream, addr, channel));
                    debug!(addr = %addr, "accepted connection");
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [9u8; KEY_LEN];

    fn peer(identity: &str, port: u16) -> PeerEntry {
        PeerEntry {
            identity: identity.to_string(),
            addr: "127.0.0.1".to_string(),
            port,
        }
    }

    fn test_queue(identity: &str, peers: Vec<PeerEntry>) -> ConnectionQueue {
        ConnectionQueue::new(
            identity,
            KEY,
            peers,
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_batch_travels_between_two_queues() {
        let mut acceptor = test_queue("sv2", vec![]);
        acceptor.bind("127.0.0.1", 0).await.unwrap();
        let port = acceptor.local_port().unwrap();

        let mut initiator = test_queue("sv5", vec![peer("sv2", port)]);

        let batch = b"\x01\x00\x00\x00 one fake record".to_vec();
        initiator.broadcast(&batch).await;

        // Drive both sides cooperatively until the batch lands.
        let mut received = None;
        for _ in 0..200 {
            acceptor.service_once().await;
            initiator.service_once().await;
            if let Some(got) = acceptor.pop() {
                received = Some(got);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (peer_id, data) = received.expect("batch never arrived");
        assert_eq!(peer_id, "sv5");
        assert_eq!(data, batch);
    }

    #[tokio::test]
    async fn test_key_mismatch_never_delivers() {
        let mut acceptor = test_queue("sv2", vec![]);
        acceptor.bind("127.0.0.1", 0).await.unwrap();
        let port = acceptor.local_port().unwrap();

        let mut initiator = ConnectionQueue::new(
            "sv5",
            [0xaa; KEY_LEN],
            vec![peer("sv2", port)],
            Duration::from_secs(2),
            Duration::from_secs(5),
        );

        initiator.broadcast(b"secret batch").await;

        for _ in 0..50 {
            acceptor.service_once().await;
            initiator.service_once().await;
            assert!(acceptor.pop().is_none());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // The failed handshake must also have reaped the connection.
        assert_eq!(acceptor.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_stalled_connection_is_reaped() {
        let mut acceptor = ConnectionQueue::new(
            "sv2",
            KEY,
            vec![],
            Duration::from_secs(2),
            Duration::from_millis(50),
        );
        acceptor.bind("127.0.0.1", 0).await.unwrap();
        let port = acceptor.local_port().unwrap();

        // A client that connects but never takes part in the handshake.
        let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        acceptor.service_once().await;
        assert_eq!(acceptor.active_connections(), 1);

        // Let the staleness window pass with no progress.
        tokio::time::sleep(Duration::from_millis(120)).await;
        for _ in 0..10 {
            acceptor.service_once().await;
            if acceptor.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acceptor.active_connections(), 0);
        assert!(acceptor.pop().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_unreachable_peer() {
        // Port 1 is essentially never listening; connect must fail fast
        // and leave no connection behind.
        let mut q = test_queue("sv5", vec![peer("sv9", 1)]);
        q.broadcast(b"batch").await;
        assert_eq!(q.active_connections(), 0);
    }
}
