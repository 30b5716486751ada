//! Plotsync
//!
//! Peer-to-peer replication of drone geolocation plots across servers that
//! share no common clock.
//!
//! Each node runs a [`ReplServer`]: a single-threaded cooperative polling
//! loop that periodically ships new local plot records to every peer over a
//! mutually authenticated, AES-CFB encrypted TCP channel, and drains inbound
//! batches into the shared store. Because peers' clocks drift, the same
//! physical observation can arrive twice with different timestamps; the
//! deconfliction engine detects those duplicates, infers each peer's clock
//! offset from them, rewrites history once an offset is known, and keeps the
//! store duplicate-free.
//!
//! # Module structure
//!
//! - `protocol/`: public interface (ReplServer, ReplConfig, ReplError)
//! - `network/`: wire framing, crypto, the channel state machine, the
//!   connection queue
//! - `data/`: plot records, the fixed-width wire codec, the in-memory store
//! - `dedup`: duplicate detection and clock-skew correction
//!
//! # Quick start
//!
//! ```ignore
//! use plotsync::{PlotStore, ReplConfig, ReplServer};
//!
//! let mut store = PlotStore::new();
//! store.load_csv("plots.csv".as_ref())?;
//!
//! let config = ReplConfig {
//!     identity: "sv1".to_string(),
//!     peers: vec![ReplConfig::parse_peer_spec("sv2=10.0.0.2:9999")?],
//!     ..ReplConfig::default()
//! };
//!
//! let mut server = ReplServer::new(store, config);
//! let shutdown = server.shutdown_handle();
//! server.run().await?;
//! ```

pub mod data;
pub mod dedup;
pub mod network;
pub mod protocol;

pub use data::{PlotRecord, PlotStore};
pub use dedup::Deconflictor;
pub use protocol::{ReplConfig, ReplError, ReplServer};
