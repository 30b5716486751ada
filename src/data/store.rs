//! In-memory plot store.
//!
//! An ordered collection of [`PlotRecord`]s with the small contract the
//! replication loop and the deconfliction engine need: insert, erase by
//! position, sort by time, iterate. The store is accessed from a single
//! logical thread by design; anyone parallelizing connection handling must
//! wrap it in explicit synchronization first.
//!
//! Two persistence formats are provided so a node can be seeded with
//! observations at startup and dump the reconciled store at shutdown: CSV
//! for hand-edited fixtures, and a binary form of concatenated fixed-width
//! wire records for round-tripping between nodes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::warn;

use super::plot::{PlotRecord, FLAG_NEW, PLOT_WIRE_LEN};

/// Ordered collection of plot records.
#[derive(Debug, Default)]
pub struct PlotStore {
    records: Vec<PlotRecord>,
}

impl PlotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a record from its fields, flagged as new (unreplicated).
    pub fn insert(&mut self, drone_id: u32, node_id: u32, timestamp: i64, lat: f64, lon: f64) {
        let mut rec = PlotRecord::new(drone_id, node_id, timestamp, lat, lon);
        rec.set_flag(FLAG_NEW);
        self.records.push(rec);
    }

    /// Add an already-built record, preserving its flags.
    pub fn push(&mut self, rec: PlotRecord) {
        self.records.push(rec);
    }

    /// Record at `idx`, if in bounds.
    pub fn get(&self, idx: usize) -> Option<&PlotRecord> {
        self.records.get(idx)
    }

    /// Mutable record at `idx`, if in bounds.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PlotRecord> {
        self.records.get_mut(idx)
    }

    /// Remove the record at `idx`. Later records shift down by one.
    pub fn erase(&mut self, idx: usize) {
        if idx < self.records.len() {
            self.records.remove(idx);
        }
    }

    /// Sort records by timestamp, oldest first.
    pub fn sort_by_time(&mut self) {
        self.records.sort_by_key(|r| r.timestamp);
    }

    /// Iterate over records in order.
    pub fn iter(&self) -> std::slice::Iter<'_, PlotRecord> {
        self.records.iter()
    }

    /// Iterate mutably over records in order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PlotRecord> {
        self.records.iter_mut()
    }

    /// Load records from a CSV file of `drone_id,node_id,timestamp,lat,lon`
    /// lines, flagging each as new. Malformed lines are logged and skipped.
    /// Returns the number of records loaded.
    pub fn load_csv(&mut self, path: &Path) -> std::io::Result<usize> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut loaded = 0;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_csv_line(trimmed) {
                Some((drone, node, ts, lat, lon)) => {
                    self.insert(drone, node, ts, lat, lon);
                    loaded += 1;
                }
                None => {
                    warn!(line = lineno + 1, "skipping malformed plot line");
                }
            }
        }
        Ok(loaded)
    }

    /// Write all records as CSV, one `drone_id,node_id,timestamp,lat,lon`
    /// line per record.
    pub fn save_csv(&self, path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for rec in &self.records {
            writeln!(
                writer,
                "{},{},{},{},{}",
                rec.drone_id, rec.node_id, rec.timestamp, rec.latitude, rec.longitude
            )?;
        }
        writer.flush()
    }

    /// Load records from a binary file of concatenated fixed-width wire
    /// records, flagging each as new. A trailing partial record means the
    /// file is corrupt and the whole load is rejected. Returns the number
    /// of records loaded.
    pub fn load_binary(&mut self, path: &Path) -> std::io::Result<usize> {
        let data = std::fs::read(path)?;
        if data.len() % PLOT_WIRE_LEN != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "file length {} is not a multiple of record width {}",
                    data.len(),
                    PLOT_WIRE_LEN
                ),
            ));
        }
        let mut loaded = 0;
        for chunk in data.chunks_exact(PLOT_WIRE_LEN) {
            if let Some(rec) = PlotRecord::from_wire(chunk) {
                self.insert(rec.drone_id, rec.node_id, rec.timestamp, rec.latitude, rec.longitude);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Write all records as concatenated fixed-width wire records. Flags
    /// never cross into the file.
    pub fn save_binary(&self, path: &Path) -> std::io::Result<()> {
        let mut body = Vec::with_capacity(self.records.len() * PLOT_WIRE_LEN);
        for rec in &self.records {
            rec.write_wire(&mut body);
        }
        std::fs::write(path, body)
    }
}

fn parse_csv_line(line: &str) -> Option<(u32, u32, i64, f64, f64)> {
    let mut fields = line.split(',').map(str::trim);
    let drone = fields.next()?.parse().ok()?;
    let node = fields.next()?.parse().ok()?;
    let ts = fields.next()?.parse().ok()?;
    let lat = fields.next()?.parse().ok()?;
    let lon = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((drone, node, ts, lat, lon))
}
