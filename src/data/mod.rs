//! Plot records and the in-memory store.

pub mod plot;
pub mod store;

pub use plot::{is_duplicate, PlotRecord, DUP_TIME_TOLERANCE, FLAG_NEW, PLOT_WIRE_LEN};
pub use store::PlotStore;
