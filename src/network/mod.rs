//! Secure point-to-point transport.
//!
//! - `wire`: `<TAG>…</TAG>` byte-marker framing
//! - `crypto`: AES-CFB pre-shared-key encryption with IV prefix
//! - `channel`: the handshake/transfer state machine, socket-free
//! - `conn`: driver binding one channel to one TCP socket
//! - `queue`: listener, live connections, peer roster, inbound batches

pub mod channel;
pub mod conn;
pub mod crypto;
pub mod queue;
pub mod wire;

pub use channel::{Channel, Effect, Event, Stage};
pub use queue::{ConnectionQueue, PeerEntry};
