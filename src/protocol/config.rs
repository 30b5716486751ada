//! Replication server configuration.

use std::time::Duration;

use crate::network::crypto::KEY_LEN;
use crate::network::PeerEntry;

use super::error::ReplError;

/// Configuration for a replication node.
#[derive(Clone)]
pub struct ReplConfig {
    /// Address to bind the listening socket.
    pub bind_addr: String,

    /// Port to bind the listening socket. Port 0 lets the OS pick.
    pub bind_port: u16,

    /// This node's identity string, a two-character prefix followed by its
    /// numeric id, e.g. `sv5`.
    pub identity: String,

    /// Pre-shared AES key, common to all peers.
    pub key: [u8; KEY_LEN],

    /// Known peers to replicate to.
    pub peers: Vec<PeerEntry>,

    /// Simulation speed multiplier; 2.0 runs simulated time twice as fast.
    pub time_mult: f32,

    /// Simulated seconds between replication bursts.
    /// Default: 20
    pub repl_interval_secs: u64,

    /// Cooperative sleep between loop iterations.
    /// Default: 1ms
    pub poll_sleep: Duration,

    /// Timeout for opening an outbound connection.
    /// Default: 2s
    pub connect_timeout: Duration,

    /// Drop a connection whose handshake makes no progress for this long.
    /// Default: 30s
    pub stale_after: Duration,
}

impl std::fmt::Debug for ReplConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplConfig")
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .field("identity", &self.identity)
            .field("key", &"[REDACTED]")
            .field("peers", &self.peers)
            .field("time_mult", &self.time_mult)
            .field("repl_interval_secs", &self.repl_interval_secs)
            .field("poll_sleep", &self.poll_sleep)
            .field("connect_timeout", &self.connect_timeout)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 9999,
            identity: "sv1".to_string(),
            key: [0u8; KEY_LEN],
            peers: Vec::new(),
            time_mult: 1.0,
            repl_interval_secs: 20,
            poll_sleep: Duration::from_millis(1),
            connect_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl ReplConfig {
    /// Config with fast intervals for tests: OS-assigned port, accelerated
    /// time, short staleness window.
    pub fn for_testing(identity: &str) -> Self {
        Self {
            bind_port: 0,
            identity: identity.to_string(),
            key: [7u8; KEY_LEN],
            time_mult: 100.0,
            stale_after: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Set the pre-shared key.
    pub fn with_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.key = key;
        self
    }

    /// Set the peer roster.
    pub fn with_peers(mut self, peers: Vec<PeerEntry>) -> Self {
        self.peers = peers;
        self
    }

    /// Numeric node id parsed from an identity string by skipping the
    /// two-character prefix, so `sv12` yields 12.
    pub fn parse_node_id(identity: &str) -> Result<u32, ReplError> {
        let suffix = identity.get(2..).filter(|s| !s.is_empty()).ok_or_else(|| {
            ReplError::Config(format!(
                "identity '{}' too short, expected prefix plus numeric id",
                identity
            ))
        })?;
        suffix.parse().map_err(|_| {
            ReplError::Config(format!("identity '{}' has no numeric suffix", identity))
        })
    }

    /// Parse a peer flag of the form `<identity>=<addr>:<port>`.
    pub fn parse_peer_spec(spec: &str) -> Result<PeerEntry, ReplError> {
        let bad = || ReplError::Config(format!("bad peer spec '{}', expected id=addr:port", spec));

        let (identity, endpoint) = spec.split_once('=').ok_or_else(bad)?;
        let (addr, port) = endpoint.rsplit_once(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;
        if identity.is_empty() || addr.is_empty() {
            return Err(bad());
        }
        // Validate the identity early, the election needs the numeric id.
        Self::parse_node_id(identity)?;

        Ok(PeerEntry {
            identity: identity.to_string(),
            addr: addr.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_id() {
        assert_eq!(ReplConfig::parse_node_id("sv5").unwrap(), 5);
        assert_eq!(ReplConfig::parse_node_id("sv12").unwrap(), 12);
        assert!(ReplConfig::parse_node_id("sv").is_err());
        assert!(ReplConfig::parse_node_id("s").is_err());
        assert!(ReplConfig::parse_node_id("svx").is_err());
    }

    #[test]
    fn test_parse_peer_spec() {
        let peer = ReplConfig::parse_peer_spec("sv2=127.0.0.1:9998").unwrap();
        assert_eq!(peer.identity, "sv2");
        assert_eq!(peer.addr, "127.0.0.1");
        assert_eq!(peer.port, 9998);

        assert!(ReplConfig::parse_peer_spec("sv2").is_err());
        assert!(ReplConfig::parse_peer_spec("sv2=localhost").is_err());
        assert!(ReplConfig::parse_peer_spec("sv2=:9998").is_err());
        assert!(ReplConfig::parse_peer_spec("=127.0.0.1:9998").is_err());
        assert!(ReplConfig::parse_peer_spec("bad=127.0.0.1:notaport").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = ReplConfig::default().with_key([0x42; KEY_LEN]);
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("0x42"));
    }

    #[test]
    fn test_default_replication_interval_matches_protocol() {
        // Peers expect a burst roughly every 20 simulated seconds.
        assert_eq!(ReplConfig::default().repl_interval_secs, 20);
    }
}
