//! Replication orchestrator.
//!
//! [`ReplServer`] runs a single-threaded cooperative polling loop: service
//! every connection one step, elect a leader once, ship new local plots to
//! every peer on a fixed simulated-time cadence, and drain inbound batches
//! into the store with incremental deduplication. No step blocks on the
//! network; cancellation is a shutdown flag polled at the top of each
//! iteration, with one final deconfliction pass before exit.
//!
//! Leader election is deliberately primitive: the numerically smallest node
//! id among self and the configured peers wins, decided once per process
//! with no failure detection or re-election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::data::{PlotRecord, PlotStore, FLAG_NEW, PLOT_WIRE_LEN};
use crate::dedup::Deconflictor;
use crate::network::ConnectionQueue;

use super::config::ReplConfig;
use super::error::ReplError;

/// The replication server for one node.
pub struct ReplServer {
    config: ReplConfig,
    queue: ConnectionQueue,
    store: PlotStore,
    dedup: Deconflictor,
    shutdown: Arc<AtomicBool>,
}

impl ReplServer {
    /// Build a server around an existing plot store.
    pub fn new(store: PlotStore, config: ReplConfig) -> Self {
        let queue = ConnectionQueue::new(
            &config.identity,
            config.key,
            config.peers.clone(),
            config.connect_timeout,
            config.stale_after,
        );
        Self {
            config,
            queue,
            store,
            dedup: Deconflictor::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag polled at the top of every loop iteration. Setting it stops the
    /// loop after the current iteration; no in-flight connection is aborted
    /// mid-handshake by this flag.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the listening socket, returning the actual port. `run` binds on
    /// its own if this was not called first; calling it early is useful when
    /// the configured port is 0.
    pub async fn bind(&mut self) -> Result<u16, ReplError> {
        self.queue
            .bind(&self.config.bind_addr, self.config.bind_port)
            .await?;
        let port = self
            .queue
            .local_port()
            .ok_or_else(|| ReplError::Io("listener has no local address".to_string()))?;
        info!(addr = %self.config.bind_addr, port, "server bound and listening");
        Ok(port)
    }

    /// Reclaim the store after the loop has exited.
    pub fn into_store(self) -> PlotStore {
        self.store
    }

    /// Run the replication loop until shutdown.
    pub async fn run(&mut self) -> Result<(), ReplError> {
        if self.queue.local_port().is_none() {
            self.bind().await?;
        }

        let start = Instant::now();
        let mut last_repl = 0.0;
        let mut reported = false;

        while !self.shutdown.load(Ordering::Relaxed) {
            self.queue.service_once().await;

            // Election and engine configuration happen exactly once per
            // process, on the first iteration. Peer churn after this point
            // does not re-run the election; a known design limitation.
            if !reported {
                let (self_id, leader, nodes) = self.elect()?;
                self.dedup.configure(self_id, leader, nodes);
                reported = true;
            }

            if self.adjusted_time(start) - last_repl > self.config.repl_interval_secs as f64 {
                self.replicate_new_plots().await;
                last_repl = self.adjusted_time(start);
            }

            while let Some((peer, data)) = self.queue.pop() {
                self.ingest_batch(&peer, &data)?;
            }

            tokio::time::sleep(self.config.poll_sleep).await;
        }

        info!("shutdown requested, running final deconfliction pass");
        self.dedup.deduplicate(&mut self.store);
        self.dedup.align_to_leader(&mut self.store);
        Ok(())
    }

    /// Seconds of simulated time since `start`.
    fn adjusted_time(&self, start: Instant) -> f64 {
        start.elapsed().as_secs_f64() * self.config.time_mult as f64
    }

    /// Lowest node id among self and every known peer wins. Returns
    /// (self id, leader id, total node count including self).
    fn elect(&self) -> Result<(u32, u32, usize), ReplError> {
        let self_id = ReplConfig::parse_node_id(self.queue.self_identity())?;
        let mut leader = self_id;
        let mut nodes = 1;
        for peer in self.queue.known_peers() {
            let id = ReplConfig::parse_node_id(&peer.identity)?;
            leader = leader.min(id);
            nodes += 1;
        }
        info!(self_id, leader, nodes, "leader elected");
        Ok((self_id, leader, nodes))
    }

    /// Collect records flagged new, clear their flags, and broadcast them
    /// as one batch to every peer.
    async fn replicate_new_plots(&mut self) {
        let batch = match encode_new_plots(&mut self.store) {
            Some((count, batch)) => {
                debug!(count, "queued new plots for replication");
                batch
            }
            None => {
                trace!("no new plots to replicate");
                return;
            }
        };
        self.queue.broadcast(&batch).await;
    }

    /// Validate and ingest one inbound batch.
    ///
    /// Structural violations (truncated header, length not a record
    /// multiple, count inconsistent with length) abort the ingest path hard;
    /// they indicate a protocol mismatch, not a flaky peer. Each record is
    /// skew-corrected if its peer's offset is already known, inserted, and
    /// followed by a full dedup pass. The per-record pass is what lets a
    /// freshly discovered offset correct history before the next record
    /// lands.
    fn ingest_batch(&mut self, peer: &str, data: &[u8]) -> Result<(), ReplError> {
        let (count, records) = decode_batch(data)?;

        for chunk in records.chunks_exact(PLOT_WIRE_LEN) {
            let mut rec = PlotRecord::from_wire(chunk).ok_or_else(|| {
                ReplError::Structural("record slice has wrong width".to_string())
            })?;
            self.dedup.apply_known_skew(&mut rec);
            self.store
                .insert(rec.drone_id, rec.node_id, rec.timestamp, rec.latitude, rec.longitude);
            self.dedup.deduplicate(&mut self.store);
        }

        debug!(peer = %peer, count, "replicated in plots");
        Ok(())
    }
}

/// Serialize every record flagged new into a count-prefixed batch, clearing
/// the flags. Returns `None` when nothing is flagged.
pub(crate) fn encode_new_plots(store: &mut PlotStore) -> Option<(u32, Vec<u8>)> {
    let mut body = Vec::new();
    let mut count: u32 = 0;
    for rec in store.iter_mut() {
        if rec.flag_set(FLAG_NEW) {
            rec.write_wire(&mut body);
            rec.clear_flag(FLAG_NEW);
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    let mut batch = Vec::with_capacity(4 + body.len());
    batch.extend_from_slice(&count.to_le_bytes());
    batch.extend_from_slice(&body);
    Some((count, batch))
}

/// Split a batch into its declared count and record bytes, enforcing the
/// structural invariants of the wire format.
pub(crate) fn decode_batch(data: &[u8]) -> Result<(u32, &[u8]), ReplError> {
    if data.len() < 4 {
        return Err(ReplError::Structural(format!(
            "batch too short for count header: {} bytes",
            data.len()
        )));
    }
    let body = &data[4..];
    if body.len() % PLOT_WIRE_LEN != 0 {
        return Err(ReplError::Structural(format!(
            "batch body of {} bytes is not a multiple of record width {}",
            body.len(),
            PLOT_WIRE_LEN
        )));
    }
    let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if body.len() != count as usize * PLOT_WIRE_LEN {
        return Err(ReplError::Structural(format!(
            "batch declares {} records but carries {} bytes",
            count,
            body.len()
        )));
    }
    Ok((count, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PeerEntry;
    use std::time::Duration;

    fn peer(identity: &str, port: u16) -> PeerEntry {
        PeerEntry {
            identity: identity.to_string(),
            addr: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_election_picks_lowest_id() {
        // Known nodes {2, 5, 9} with self = 5: leader 2, three nodes total.
        let config = ReplConfig::for_testing("sv5")
            .with_peers(vec![peer("sv2", 1111), peer("sv9", 2222)]);
        let server = ReplServer::new(PlotStore::new(), config);

        let (self_id, leader, nodes) = server.elect().unwrap();
        assert_eq!(self_id, 5);
        assert_eq!(leader, 2);
        assert_eq!(nodes, 3);
    }

    #[test]
    fn test_election_self_can_be_leader() {
        let config = ReplConfig::for_testing("sv1").with_peers(vec![peer("sv3", 1111)]);
        let server = ReplServer::new(PlotStore::new(), config);
        let (_, leader, nodes) = server.elect().unwrap();
        assert_eq!(leader, 1);
        assert_eq!(nodes, 2);
    }

    #[test]
    fn test_encode_new_plots_clears_flags() {
        let mut store = PlotStore::new();
        store.insert(1, 1, 100, 10.0, 20.0);
        store.insert(2, 1, 200, 11.0, 21.0);

        let (count, batch) = encode_new_plots(&mut store).unwrap();
        assert_eq!(count, 2);
        assert_eq!(batch.len(), 4 + 2 * PLOT_WIRE_LEN);
        assert_eq!(&batch[..4], &2u32.to_le_bytes());

        // Flags cleared, so a second sweep finds nothing.
        assert!(encode_new_plots(&mut store).is_none());
    }

    #[test]
    fn test_decode_batch_round_trip() {
        let mut store = PlotStore::new();
        store.insert(1, 1, 100, 10.0, 20.0);
        let (_, batch) = encode_new_plots(&mut store).unwrap();

        let (count, body) = decode_batch(&batch).unwrap();
        assert_eq!(count, 1);
        let rec = PlotRecord::from_wire(body).unwrap();
        assert_eq!(rec.drone_id, 1);
        assert_eq!(rec.timestamp, 100);
    }

    #[test]
    fn test_decode_batch_structural_errors() {
        // Too short for the header.
        assert!(matches!(
            decode_batch(&[1, 0]),
            Err(ReplError::Structural(_))
        ));

        // Body not a record multiple.
        let mut bad = 1u32.to_le_bytes().to_vec();
        bad.extend_from_slice(&[0u8; PLOT_WIRE_LEN - 1]);
        assert!(matches!(decode_batch(&bad), Err(ReplError::Structural(_))));

        // Count disagrees with body length.
        let mut bad = 2u32.to_le_bytes().to_vec();
        bad.extend_from_slice(&[0u8; PLOT_WIRE_LEN]);
        assert!(matches!(decode_batch(&bad), Err(ReplError::Structural(_))));
    }

    #[test]
    fn test_ingest_batch_inserts_and_dedups() {
        let config = ReplConfig::for_testing("sv1").with_peers(vec![peer("sv2", 1111)]);
        let mut server = ReplServer::new(PlotStore::new(), config);
        server.store.insert(1, 1, 100, 10.0, 20.0);
        let (self_id, leader, nodes) = server.elect().unwrap();
        server.dedup.configure(self_id, leader, nodes);

        // Peer sv2 sends a duplicate of our observation plus a fresh one.
        let mut peer_store = PlotStore::new();
        peer_store.insert(1, 2, 105, 10.0, 20.0);
        peer_store.insert(3, 2, 250, 1.0, 2.0);
        let (_, batch) = encode_new_plots(&mut peer_store).unwrap();

        server.ingest_batch("sv2", &batch).unwrap();

        // The duplicate collapsed and yielded offset(2) = 5, which also
        // corrected the fresh record from 250 to 245.
        assert_eq!(server.dedup.offset_of(2), Some(5.0));
        assert_eq!(server.store.len(), 2);
        let times: Vec<i64> = server.store.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![100, 245]);
    }

    #[test]
    fn test_ingest_rejects_malformed_batch() {
        let config = ReplConfig::for_testing("sv1");
        let mut server = ReplServer::new(PlotStore::new(), config);
        let err = server.ingest_batch("sv2", &[9, 9]).unwrap_err();
        assert!(matches!(err, ReplError::Structural(_)));
        assert!(server.store.is_empty());
    }

    #[tokio::test]
    async fn test_two_servers_replicate_end_to_end() {
        let mut receiver = ReplServer::new(PlotStore::new(), ReplConfig::for_testing("sv1"));
        let port = receiver.bind().await.unwrap();

        let mut sender_store = PlotStore::new();
        sender_store.insert(1, 2, 100, 10.0, 20.0);
        sender_store.insert(2, 2, 150, 11.0, 21.0);
        let sender_config =
            ReplConfig::for_testing("sv2").with_peers(vec![peer("sv1", port)]);
        let mut sender = ReplServer::new(sender_store, sender_config);
        sender.bind().await.unwrap();

        let stop_recv = receiver.shutdown_handle();
        let stop_send = sender.shutdown_handle();

        let recv_task = tokio::spawn(async move {
            receiver.run().await.unwrap();
            receiver.into_store()
        });
        let send_task = tokio::spawn(async move {
            sender.run().await.unwrap();
        });

        // time_mult = 100, so the 20-simulated-second burst fires after
        // roughly 200ms of real time. Leave generous slack.
        tokio::time::sleep(Duration::from_secs(2)).await;
        stop_send.store(true, std::sync::atomic::Ordering::Relaxed);
        stop_recv.store(true, std::sync::atomic::Ordering::Relaxed);

        send_task.await.unwrap();
        let store = recv_task.await.unwrap();

        assert_eq!(store.len(), 2);
        let drones: Vec<u32> = store.iter().map(|r| r.drone_id).collect();
        assert_eq!(drones, vec![1, 2]);
    }
}
