//! Lock-code lifecycle for latchkey.
//!
//! Ties the durable store and the device gateway together into the
//! `LifecycleEngine`: slot allocation, timed activation and expiry on a
//! single-threaded `Scheduler`, verification against the lock, manual
//! deletion, and reconciliation after a restart. Also provides daemon
//! configuration, the data-directory lock, and shutdown signalling.

pub mod allocator;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod scheduler;

pub use allocator::{merge_view, used_slots, SlotAllocator, SlotView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{install_signal_handler, shutdown_requested, DaemonLock};
pub use config::Config;
pub use engine::{Activation, CodeListing, CreatedCode, LifecycleEngine, ReconcileReport};
pub use scheduler::{ActionHandler, ActionId, ActionKind, ScheduledAction, Scheduler, SchedulerHandle};

use latchkey_device::DeviceError;
use latchkey_store::{Slot, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid window: enable time {enable_at} must be before expiry {expire_at}")]
    InvalidWindow { enable_at: String, expire_at: String },
    #[error("no free slot: all {capacity} slots are in use")]
    NoSlotAvailable { capacity: u16 },
    #[error("invalid holder: {0}")]
    InvalidHolder(String),
    #[error("activation of slot {slot} unconfirmed: {reason}")]
    ActivationUnconfirmed { slot: Slot, reason: String },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True when the lock could not be reached at all, as opposed to
    /// answering in a way we did not expect.
    pub fn is_gateway_unreachable(&self) -> bool {
        matches!(self, CoreError::Device(DeviceError::Unreachable(_)))
    }

    /// True for errors caused by the request itself rather than by the
    /// system's state or environment.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidWindow { .. } | CoreError::InvalidHolder(_)
        )
    }
}
