//! Replication server errors.
//!
//! Connection-level failures (framing, authentication, transport loss) never
//! surface here; they are logged and resolved by dropping the offending
//! connection. This type covers what remains: configuration problems caught
//! before the loop starts, I/O failures on the listener or store files, and
//! structural errors in inbound batches, which indicate a protocol-version
//! mismatch and abort the ingest cycle rather than corrupt the store.

/// Errors surfaced by the replication server.
#[derive(Debug)]
pub enum ReplError {
    /// Invalid configuration (bad key, bad identity, bad peer spec).
    Config(String),
    /// Listener or store file I/O failure.
    Io(String),
    /// Malformed inbound batch: wrong size multiple or count mismatch.
    /// Continuing would corrupt the record store.
    Structural(String),
}

impl std::fmt::Display for ReplError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplError::Config(e) => write!(f, "configuration error: {}", e),
            ReplError::Io(e) => write!(f, "io error: {}", e),
            ReplError::Structural(e) => write!(f, "structural error: {}", e),
        }
    }
}

impl std::error::Error for ReplError {}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        ReplError::Io(e.to_string())
    }
}
