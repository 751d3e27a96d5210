use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the meshdns protocol library.
///
/// Everything below the gossip round loop returns these as values;
/// only the round loop and the CLI decide between retry and exit.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state file {path} exists but could not be read: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid hostname label: {0}")]
    InvalidLabel(String),

    #[error("peer {url} unreachable: {reason}")]
    PeerUnreachable { url: String, reason: String },

    #[error("peer {url} returned HTTP {status}")]
    PeerStatus { url: String, status: u16 },

    #[error("gossip round to {0} timed out")]
    RoundTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}
