//! Durable state for latchkey.
//!
//! Two JSON documents keyed by slot number live under the data directory:
//! the active lock codes (`CredentialStore`) and the latest failed activation
//! per slot (`FailureLog`). Both are read whole and written whole through an
//! atomic temp-file rename, and both load as empty when missing or corrupt.

mod document;

pub mod codes;
pub mod failures;
pub mod layout;
pub mod types;

pub use codes::{CredentialRecord, CredentialStore};
pub use failures::{FailureLog, FailureRecord};
pub use layout::StoreLayout;
pub use types::{format_timestamp, parse_timestamp, Slot, Timestamp, TIMESTAMP_FORMAT};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store document '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("invalid slot: {0}")]
    InvalidSlot(String),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}
