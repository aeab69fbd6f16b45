use crate::CoreError;
use latchkey_device::{DeviceGateway, LiveCodes};
use latchkey_store::types::timestamp_format;
use latchkey_store::{CredentialRecord, CredentialStore, Slot, Timestamp};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// Picks the lowest free slot in `1..=capacity`.
///
/// A slot is used if this system holds a record for it or if the lock reports
/// a code there. The lock is authoritative for what is present, the store for
/// what was intended, so codes added out of band are never overwritten.
#[derive(Debug, Clone, Copy)]
pub struct SlotAllocator {
    capacity: u16,
}

impl SlotAllocator {
    pub fn new(capacity: u16) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Query the lock and return the first slot neither side is using.
    ///
    /// An unreachable lock is an error rather than an empty lock: allocating
    /// blind could clobber a code we cannot see.
    pub fn next_free_slot(
        &self,
        store: &CredentialStore,
        gateway: &dyn DeviceGateway,
    ) -> Result<Option<Slot>, CoreError> {
        let live = gateway.query_live_codes()?;
        let stored = store.list();
        Ok(self.first_free(&used_slots(&stored, &live)))
    }

    pub fn first_free(&self, used: &BTreeSet<Slot>) -> Option<Slot> {
        Slot::range(self.capacity).find(|slot| !used.contains(slot))
    }
}

pub fn used_slots(stored: &BTreeMap<Slot, CredentialRecord>, live: &LiveCodes) -> BTreeSet<Slot> {
    stored.keys().chain(live.keys()).copied().collect()
}

/// One row of the merged store/device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub slot: Slot,
    /// Name as the lock reports it when live, otherwise as stored.
    pub holder: String,
    pub code: Option<String>,
    #[serde(serialize_with = "optional_timestamp")]
    pub enable_at: Option<Timestamp>,
    #[serde(serialize_with = "optional_timestamp")]
    pub expire_at: Option<Timestamp>,
    /// Whether the lock currently has this slot. `None` when the lock could not be read.
    pub live: Option<bool>,
    /// Whether this system holds a record (and schedule) for the slot.
    pub managed: bool,
}

fn optional_timestamp<S: Serializer>(ts: &Option<Timestamp>, serializer: S) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => timestamp_format::serialize(ts, serializer),
        None => serializer.serialize_none(),
    }
}

/// Merge stored intent with the lock's live state, one row per slot seen by either.
pub fn merge_view(
    stored: &BTreeMap<Slot, CredentialRecord>,
    live: Option<&LiveCodes>,
) -> Vec<SlotView> {
    let mut slots: BTreeSet<Slot> = stored.keys().copied().collect();
    if let Some(live) = live {
        slots.extend(live.keys().copied());
    }

    slots
        .into_iter()
        .map(|slot| {
            let record = stored.get(&slot);
            let live_holder = live.and_then(|l| l.get(&slot));
            let holder = live_holder
                .or(record.map(|r| &r.holder))
                .cloned()
                .unwrap_or_default();
            SlotView {
                slot,
                holder,
                code: record.map(|r| r.code.clone()),
                enable_at: record.map(|r| r.enable_at),
                expire_at: record.map(|r| r.expire_at),
                live: live.map(|l| l.contains_key(&slot)),
                managed: record.is_some(),
            }
        })
        .collect()
}
