//! Drone plot records and their fixed-width wire codec.
//!
//! A plot is one position observation: which drone, which node reported it,
//! when, and where. The wire layout is fixed-width little-endian in the order
//! (drone id, node id, timestamp, latitude, longitude); the transient flag
//! byte never crosses the wire.

/// Record has not been replicated to peers yet.
pub const FLAG_NEW: u8 = 0x01;

/// Serialized size of one plot on the wire: u32 + u32 + i64 + f64 + f64.
pub const PLOT_WIRE_LEN: usize = 32;

/// Two plots of the same drone at the same coordinates are considered the
/// same observation when their timestamps fall within this window (seconds).
/// The window absorbs uncorrected clock skew between reporting nodes.
pub const DUP_TIME_TOLERANCE: i64 = 20;

/// One drone position observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotRecord {
    /// Identifier of the observed drone.
    pub drone_id: u32,
    /// Identifier of the node that reported the observation.
    pub node_id: u32,
    /// Observation time in seconds, in the reporting node's clock basis
    /// until skew correction rewrites it into ours.
    pub timestamp: i64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Transient local flags, never serialized.
    pub flags: u8,
}

impl PlotRecord {
    /// Create a record with no flags set.
    pub fn new(drone_id: u32, node_id: u32, timestamp: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            drone_id,
            node_id,
            timestamp,
            latitude,
            longitude,
            flags: 0,
        }
    }

    /// Check a transient flag.
    pub fn flag_set(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Set a transient flag.
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    /// Clear a transient flag.
    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    /// Append the fixed-width wire form to `out`.
    pub fn write_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.drone_id.to_le_bytes());
        out.extend_from_slice(&self.node_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.latitude.to_le_bytes());
        out.extend_from_slice(&self.longitude.to_le_bytes());
    }

    /// Decode one record from exactly [`PLOT_WIRE_LEN`] bytes.
    ///
    /// Returns `None` if the slice has the wrong length.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() != PLOT_WIRE_LEN {
            return None;
        }
        let drone_id = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let node_id = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let timestamp = i64::from_le_bytes(buf[8..16].try_into().ok()?);
        let latitude = f64::from_le_bytes(buf[16..24].try_into().ok()?);
        let longitude = f64::from_le_bytes(buf[24..32].try_into().ok()?);
        Some(Self::new(drone_id, node_id, timestamp, latitude, longitude))
    }
}

/// Duplicate predicate: same drone, bit-exact coordinates, timestamps within
/// the tolerance window. Coordinate equality is deliberately exact, peers
/// retransmit identical source values so no epsilon is applied.
pub fn is_duplicate(a: &PlotRecord, b: &PlotRecord) -> bool {
    a.drone_id == b.drone_id
        && a.latitude == b.latitude
        && a.longitude == b.longitude
        && (a.timestamp - b.timestamp).abs() <= DUP_TIME_TOLERANCE
}
