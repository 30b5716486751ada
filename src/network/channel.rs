//! Secure channel state machine.
//!
//! One [`Channel`] tracks a single peer connection through the mutual
//! challenge/response handshake, identity exchange, and replication payload
//! transfer. The protocol is asymmetric: the connection-initiating side and
//! the accepting side run distinct stage sequences.
//!
//! The machine is deliberately socket-free. It advances through
//! [`Channel::on_event`], which maps (current stage, event) to a new stage
//! plus a list of [`Effect`]s for the socket driver to apply. Each invocation
//! advances at most one stage; the driver polls the socket and re-invokes
//! cooperatively. Handshake failures are terminal for the connection, the
//! orchestrator's reconnection policy decides whether to try again on a
//! fresh socket.
//!
//! Each [`Event::Data`] must carry one complete frame. There is no partial
//! reassembly across polls: a message split between TCP reads fails framing
//! and drops the connection. Every protocol message is a single small write
//! on the sending side, so in practice a drain sees whole frames.
//!
//! Handshake sequence (acceptor proves the initiator first, then the mirror
//! image proves the acceptor):
//!
//! 1. Acceptor sends a 16-byte random challenge in a plaintext AUT frame.
//! 2. Initiator echoes it back encrypted under the pre-shared key.
//! 3. Acceptor decrypts, compares byte-for-byte, and on a match sends a
//!    one-byte plaintext go-ahead; mismatch disconnects.
//! 4. Initiator sends its own plaintext challenge; acceptor echoes it
//!    encrypted; initiator verifies.
//! 5. Plaintext SID frames exchange node identities, the initiator ships the
//!    REP payload, and the acceptor answers with a bare `<ACK>`.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};

use super::crypto::{self, KEY_LEN};
use super::wire::{self, Tag, ACK};

/// Challenge size in bytes.
pub const CHALLENGE_LEN: usize = 16;

/// Connection stage. Initiator and acceptor variants are disjoint; a channel
/// only ever visits the stages of its own role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    // Initiator stages.
    /// Waiting for the acceptor's plaintext challenge.
    AwaitChallenge,
    /// Echo sent; waiting for the acceptor's go-ahead before challenging it.
    AwaitGoAhead,
    /// Own challenge sent; waiting for the acceptor's encrypted echo.
    AwaitProof,
    /// Mutually authenticated; send our identity on the next poll.
    SendIdentity,
    /// Identity sent; waiting for the peer's identity before transmitting.
    AwaitIdentity,
    /// Payload sent; waiting for the acknowledgement.
    AwaitAck,

    // Acceptor stages.
    /// Fresh connection; send our challenge on the next poll.
    SendChallenge,
    /// Challenge sent; waiting for the encrypted echo.
    VerifyEcho,
    /// Initiator verified; waiting for its challenge to prove ourselves.
    ProveSelf,
    /// Waiting for the initiator's identity frame.
    AwaitPeerIdentity,
    /// Waiting for the replication payload.
    AwaitPayload,
    /// Payload received and buffered; waiting to be drained by the queue.
    HasData,

    /// Connection finished or failed.
    Closed,
}

/// Input to one state machine step.
#[derive(Debug)]
pub enum Event {
    /// Periodic poll with no inbound bytes. Drives send-only stages.
    Poll,
    /// All bytes currently available on the socket.
    Data(Vec<u8>),
}

/// Side effects for the socket driver to apply, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum Effect {
    /// Write these bytes to the socket.
    Send(Vec<u8>),
    /// Close the socket.
    Disconnect,
}

/// State for one peer connection. No `Debug` impl: the struct carries the
/// pre-shared key.
pub struct Channel {
    stage: Stage,
    key: [u8; KEY_LEN],
    self_id: String,
    peer_id: Option<String>,
    challenge: [u8; CHALLENGE_LEN],
    /// Pre-framed REP message, initiator role only.
    outbound: Vec<u8>,
    /// Received batch bytes, acceptor role only.
    received: Option<Vec<u8>>,
}

impl Channel {
    /// Channel for a connection we initiated, carrying `batch` to the peer.
    /// The payload is framed up front so transmission is a single write.
    pub fn initiate(key: [u8; KEY_LEN], self_id: &str, batch: &[u8]) -> Self {
        Self {
            stage: Stage::AwaitChallenge,
            key,
            self_id: self_id.to_string(),
            peer_id: None,
            challenge: [0u8; CHALLENGE_LEN],
            outbound: wire::wrap(Tag::Rep, batch),
            received: None,
        }
    }

    /// Channel for a connection we accepted.
    pub fn accept(key: [u8; KEY_LEN], self_id: &str) -> Self {
        Self {
            stage: Stage::SendChallenge,
            key,
            self_id: self_id.to_string(),
            peer_id: None,
            challenge: [0u8; CHALLENGE_LEN],
            outbound: Vec::new(),
            received: None,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Peer identity, once the SID exchange has happened.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// True once the channel has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::HasData | Stage::Closed)
    }

    /// True when the current stage waits on inbound bytes. Send-only stages
    /// advance on a bare poll instead.
    pub fn wants_input(&self) -> bool {
        !matches!(
            self.stage,
            Stage::SendChallenge | Stage::SendIdentity | Stage::HasData | Stage::Closed
        )
    }

    /// Take the buffered replication batch, closing the channel.
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        let data = self.received.take();
        if data.is_some() {
            self.stage = Stage::Closed;
        }
        data
    }

    /// Force the channel closed, e.g. on transport loss or staleness.
    pub fn close(&mut self) {
        self.stage = Stage::Closed;
        self.received = None;
    }

    /// Advance the machine one step. Returns effects for the driver to
    /// apply; an [`Effect::Disconnect`] always leaves the channel terminal.
    pub fn on_event(&mut self, event: Event) -> Vec<Effect> {
        match (self.stage, event) {
            // Acceptor: fire our challenge. Any stray bytes that arrived
            // before the handshake are discarded.
            (Stage::SendChallenge, _) => {
                OsRng.fill_bytes(&mut self.challenge);
                trace!("sending authentication challenge");
                self.stage = Stage::VerifyEcho;
                vec![Effect::Send(wire::wrap(Tag::Aut, &self.challenge))]
            }

            // Acceptor: the echo must decrypt to exactly our challenge.
            (Stage::VerifyEcho, Event::Data(buf)) => match self.decrypt_aut(&buf) {
                Ok(echo) if echo == self.challenge => {
                    trace!("peer proved itself, sending go-ahead");
                    self.stage = Stage::ProveSelf;
                    vec![Effect::Send(wire::wrap(Tag::Aut, &[1u8]))]
                }
                Ok(_) => {
                    warn!("challenge echo mismatch, rejecting connection");
                    self.fail()
                }
                Err(()) => self.fail(),
            },

            // Acceptor: prove ourselves against the initiator's challenge.
            (Stage::ProveSelf, Event::Data(buf)) => match wire::unwrap(Tag::Aut, &buf) {
                Ok(peer_challenge) => {
                    let framed = wire::wrap(Tag::Aut, &peer_challenge);
                    self.stage = Stage::AwaitPeerIdentity;
                    vec![Effect::Send(crypto::encrypt(&self.key, &framed))]
                }
                Err(e) => {
                    warn!(error = %e, "invalid challenge frame from initiator");
                    self.fail()
                }
            },

            // Acceptor: record the peer identity and answer with our own.
            (Stage::AwaitPeerIdentity, Event::Data(buf)) => match wire::unwrap(Tag::Sid, &buf) {
                Ok(sid) => {
                    self.set_peer_id(&sid);
                    self.stage = Stage::AwaitPayload;
                    vec![Effect::Send(wire::wrap(Tag::Sid, self.self_id.as_bytes()))]
                }
                Err(e) => {
                    warn!(error = %e, "invalid identity frame from initiator");
                    self.fail()
                }
            },

            // Acceptor: buffer the batch, acknowledge, and hang up.
            (Stage::AwaitPayload, Event::Data(buf)) => match wire::unwrap(Tag::Rep, &buf) {
                Ok(batch) => {
                    debug!(
                        peer = self.peer_id.as_deref().unwrap_or("?"),
                        bytes = batch.len(),
                        "replication payload received"
                    );
                    self.received = Some(batch);
                    self.stage = Stage::HasData;
                    vec![Effect::Send(ACK.to_vec()), Effect::Disconnect]
                }
                Err(e) => {
                    warn!(
                        peer = self.peer_id.as_deref().unwrap_or("?"),
                        error = %e,
                        "replication payload possibly corrupted"
                    );
                    self.fail()
                }
            },

            // Initiator: echo the acceptor's challenge back encrypted.
            (Stage::AwaitChallenge, Event::Data(buf)) => match wire::unwrap(Tag::Aut, &buf) {
                Ok(challenge) => {
                    let framed = wire::wrap(Tag::Aut, &challenge);
                    self.stage = Stage::AwaitGoAhead;
                    vec![Effect::Send(crypto::encrypt(&self.key, &framed))]
                }
                Err(e) => {
                    warn!(error = %e, "invalid challenge frame from acceptor");
                    self.fail()
                }
            },

            // Initiator: the go-ahead itself carries no information beyond
            // arrival; now issue our own challenge.
            (Stage::AwaitGoAhead, Event::Data(_)) => {
                OsRng.fill_bytes(&mut self.challenge);
                self.stage = Stage::AwaitProof;
                vec![Effect::Send(wire::wrap(Tag::Aut, &self.challenge))]
            }

            // Initiator: the acceptor's echo must match our challenge.
            (Stage::AwaitProof, Event::Data(buf)) => match self.decrypt_aut(&buf) {
                Ok(echo) if echo == self.challenge => {
                    trace!("acceptor proved itself");
                    self.stage = Stage::SendIdentity;
                    vec![]
                }
                Ok(_) => {
                    warn!("acceptor failed our challenge, rejecting connection");
                    self.fail()
                }
                Err(()) => self.fail(),
            },

            // Initiator: mutually authenticated, introduce ourselves.
            (Stage::SendIdentity, _) => {
                self.stage = Stage::AwaitIdentity;
                vec![Effect::Send(wire::wrap(Tag::Sid, self.self_id.as_bytes()))]
            }

            // Initiator: peer identity received, ship the payload.
            (Stage::AwaitIdentity, Event::Data(buf)) => match wire::unwrap(Tag::Sid, &buf) {
                Ok(sid) => {
                    self.set_peer_id(&sid);
                    debug!(
                        peer = self.peer_id.as_deref().unwrap_or("?"),
                        "authenticated, sending replication data"
                    );
                    self.stage = Stage::AwaitAck;
                    vec![Effect::Send(self.outbound.clone())]
                }
                Err(e) => {
                    warn!(error = %e, "invalid identity frame from acceptor");
                    self.fail()
                }
            },

            // Initiator: an unexpected payload here is logged but not fatal,
            // the transfer is already complete on our side.
            (Stage::AwaitAck, Event::Data(buf)) => {
                if !wire::contains(&buf, ACK) {
                    warn!(
                        peer = self.peer_id.as_deref().unwrap_or("?"),
                        "expected ack after data send, received something else"
                    );
                }
                trace!(
                    peer = self.peer_id.as_deref().unwrap_or("?"),
                    "data ack received, disconnecting"
                );
                self.stage = Stage::Closed;
                vec![Effect::Disconnect]
            }

            // A waiting stage polled with no data is a no-op; terminal
            // stages ignore everything.
            (_, Event::Poll) => vec![],
            (Stage::HasData, _) | (Stage::Closed, _) => vec![],
        }
    }

    fn set_peer_id(&mut self, sid: &[u8]) {
        self.peer_id = Some(String::from_utf8_lossy(sid).into_owned());
    }

    /// Decrypt an encrypted AUT frame, logging the specific failure.
    fn decrypt_aut(&self, buf: &[u8]) -> Result<Vec<u8>, ()> {
        let plain = crypto::decrypt(&self.key, buf).map_err(|e| {
            warn!(error = %e, "undecryptable authentication message");
        })?;
        wire::unwrap(Tag::Aut, &plain).map_err(|e| {
            warn!(error = %e, "invalid frame inside encrypted message");
        })
    }

    fn fail(&mut self) -> Vec<Effect> {
        self.stage = Stage::Closed;
        vec![Effect::Disconnect]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    /// Step one side: feed it everything in its inbox (a real socket drain
    /// returns all available bytes at once) and route its sends, tampered,
    /// into the other side's inbox.
    fn step_side(
        side: &mut Channel,
        inbox: &mut Vec<u8>,
        outbox: &mut Vec<u8>,
        msg_count: &mut usize,
        tamper: &dyn Fn(usize, Vec<u8>) -> Vec<u8>,
    ) {
        if side.is_terminal() {
            return;
        }
        let event = if side.wants_input() {
            if inbox.is_empty() {
                return;
            }
            Event::Data(std::mem::take(inbox))
        } else {
            Event::Poll
        };
        for effect in side.on_event(event) {
            if let Effect::Send(bytes) = effect {
                let bytes = tamper(*msg_count, bytes);
                *msg_count += 1;
                outbox.extend_from_slice(&bytes);
            }
        }
    }

    /// Drive an initiator/acceptor pair against each other in memory, with a
    /// byte-tampering function applied to every message in flight.
    fn run_handshake(
        initiator: &mut Channel,
        acceptor: &mut Channel,
        tamper: impl Fn(usize, Vec<u8>) -> Vec<u8>,
    ) {
        let mut to_initiator: Vec<u8> = Vec::new();
        let mut to_acceptor: Vec<u8> = Vec::new();
        let mut msg_count = 0;

        for _ in 0..32 {
            if initiator.is_terminal() && acceptor.is_terminal() {
                break;
            }
            step_side(acceptor, &mut to_acceptor, &mut to_initiator, &mut msg_count, &tamper);
            step_side(initiator, &mut to_initiator, &mut to_acceptor, &mut msg_count, &tamper);
        }
    }

    #[test]
    fn test_full_handshake_delivers_batch() {
        let batch = b"forty-two plot records".to_vec();
        let mut initiator = Channel::initiate(KEY, "sv5", &batch);
        let mut acceptor = Channel::accept(KEY, "sv2");

        run_handshake(&mut initiator, &mut acceptor, |_, b| b);

        assert_eq!(acceptor.stage(), Stage::HasData);
        assert_eq!(initiator.stage(), Stage::Closed);
        assert_eq!(acceptor.peer_id(), Some("sv5"));
        assert_eq!(initiator.peer_id(), Some("sv2"));
        assert_eq!(acceptor.take_received().unwrap(), batch);
        assert_eq!(acceptor.stage(), Stage::Closed);
    }

    #[test]
    fn test_tampered_initiator_echo_is_rejected() {
        // Message 1 is the initiator's encrypted echo of the acceptor's
        // challenge. Flipping a ciphertext byte must fail verification.
        let mut initiator = Channel::initiate(KEY, "sv5", b"batch");
        let mut acceptor = Channel::accept(KEY, "sv2");

        run_handshake(&mut initiator, &mut acceptor, |i, mut b| {
            if i == 1 {
                let last = b.len() - 1;
                b[last] ^= 0xff;
            }
            b
        });

        assert_eq!(acceptor.stage(), Stage::Closed);
        assert!(acceptor.take_received().is_none());
    }

    #[test]
    fn test_tampered_acceptor_proof_is_rejected() {
        // Message 4 is the acceptor's encrypted echo of the initiator's
        // challenge; the initiator must disconnect without sending data.
        let mut initiator = Channel::initiate(KEY, "sv5", b"batch");
        let mut acceptor = Channel::accept(KEY, "sv2");

        run_handshake(&mut initiator, &mut acceptor, |i, mut b| {
            if i == 4 {
                let last = b.len() - 1;
                b[last] ^= 0xff;
            }
            b
        });

        assert_eq!(initiator.stage(), Stage::Closed);
        // The acceptor never saw a payload.
        assert!(acceptor.take_received().is_none());
    }

    #[test]
    fn test_mismatched_keys_never_deliver_data() {
        let other_key = [8u8; KEY_LEN];
        let mut initiator = Channel::initiate(other_key, "sv5", b"batch");
        let mut acceptor = Channel::accept(KEY, "sv2");

        run_handshake(&mut initiator, &mut acceptor, |_, b| b);

        assert!(acceptor.take_received().is_none());
        assert_eq!(acceptor.stage(), Stage::Closed);
    }

    #[test]
    fn test_malformed_challenge_frame_disconnects() {
        let mut acceptor = Channel::accept(KEY, "sv2");
        // Move past SendChallenge.
        acceptor.on_event(Event::Poll);
        assert_eq!(acceptor.stage(), Stage::VerifyEcho);

        let effects = acceptor.on_event(Event::Data(b"not an encrypted frame at all".to_vec()));
        assert!(effects.contains(&Effect::Disconnect));
        assert_eq!(acceptor.stage(), Stage::Closed);
    }

    #[test]
    fn test_waiting_stage_poll_is_noop() {
        let mut initiator = Channel::initiate(KEY, "sv5", b"");
        assert!(initiator.on_event(Event::Poll).is_empty());
        assert_eq!(initiator.stage(), Stage::AwaitChallenge);
    }

    #[test]
    fn test_unexpected_payload_instead_of_ack_is_not_fatal() {
        let mut ch = Channel::initiate(KEY, "sv5", b"batch");
        ch.stage = Stage::AwaitAck;
        let effects = ch.on_event(Event::Data(b"garbage".to_vec()));
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert_eq!(ch.stage(), Stage::Closed);
    }
}
