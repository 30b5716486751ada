//! Public surface: the replication server, its configuration, and errors.

pub mod config;
pub mod error;
pub mod server;

pub use config::ReplConfig;
pub use error::ReplError;
pub use server::ReplServer;
