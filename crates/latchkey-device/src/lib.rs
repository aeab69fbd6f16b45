//! Access to the physical lock.
//!
//! The lock is reached through a hub's HTTP API. This crate defines the narrow
//! `DeviceGateway` contract the lifecycle engine relies on, an HTTP
//! implementation for the Hubitat Maker API, and an in-memory `MockGateway`.

pub mod config;
pub mod http;
pub mod mock;

pub use config::GatewayConfig;
pub use http::{parse_lock_codes, HttpGateway};
pub use mock::MockGateway;

use latchkey_store::Slot;
use std::collections::BTreeMap;
use thiserror::Error;

/// Holder name reported for a live code that carries no name.
pub const UNKNOWN_HOLDER: &str = "Unknown";

/// Codes currently programmed on the lock: slot to holder name.
pub type LiveCodes = BTreeMap<Slot, String>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected device response: {0}")]
    Protocol(String),
    #[error("device config error: {0}")]
    Config(String),
}

/// Narrow view of the lock used by slot allocation and the lifecycle engine.
///
/// `set_code` is fire-and-confirm: a successful return only means the hub
/// accepted the command. Callers verify by querying again.
pub trait DeviceGateway: Send + Sync {
    /// Codes the lock reports as present. An error means the state is unknown,
    /// not that the lock is empty.
    fn query_live_codes(&self) -> Result<LiveCodes, DeviceError>;

    fn set_code(&self, slot: Slot, code: &str, holder: &str) -> Result<(), DeviceError>;

    /// Remove a slot's code. Deleting an empty slot succeeds.
    fn delete_code(&self, slot: Slot) -> Result<(), DeviceError>;
}
