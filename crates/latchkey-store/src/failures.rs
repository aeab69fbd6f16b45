use crate::document::JsonDocument;
use crate::layout::StoreLayout;
use crate::types::timestamp_format;
use crate::{Slot, StoreError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The most recent failed activation for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub slot: Slot,
    pub code: String,
    pub holder: String,
    pub error: String,
    #[serde(with = "timestamp_format")]
    pub occurred_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFailure {
    code: String,
    user: String,
    error: String,
    #[serde(with = "timestamp_format")]
    timestamp: Timestamp,
}

impl StoredFailure {
    fn into_record(self, slot: Slot) -> FailureRecord {
        FailureRecord {
            slot,
            code: self.code,
            holder: self.user,
            error: self.error,
            occurred_at: self.timestamp,
        }
    }
}

/// Diagnostic log of failed activations, backed by `failed_codes.json`.
pub struct FailureLog {
    doc: JsonDocument<StoredFailure>,
}

impl FailureLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            doc: JsonDocument::new(layout.failures_file()),
        }
    }

    pub fn list(&self) -> BTreeMap<Slot, FailureRecord> {
        self.doc
            .read()
            .into_iter()
            .map(|(slot, stored)| (slot, stored.into_record(slot)))
            .collect()
    }

    pub fn get(&self, slot: Slot) -> Option<FailureRecord> {
        self.doc
            .read()
            .remove(&slot)
            .map(|stored| stored.into_record(slot))
    }

    /// Record a failure, overwriting any earlier one for the same slot.
    pub fn append(&self, record: &FailureRecord) -> Result<(), StoreError> {
        let stored = StoredFailure {
            code: record.code.clone(),
            user: record.holder.clone(),
            error: record.error.clone(),
            timestamp: record.occurred_at,
        };
        self.doc.modify(|entries| {
            entries.insert(record.slot, stored);
            true
        })?;
        Ok(())
    }

    pub fn delete(&self, slot: Slot) -> Result<bool, StoreError> {
        self.doc.modify(|entries| entries.remove(&slot).is_some())
    }
}
