use crate::document::JsonDocument;
use crate::layout::StoreLayout;
use crate::types::timestamp_format;
use crate::{Slot, StoreError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The intended state of one slot: which code, for whom, and when it is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub slot: Slot,
    pub code: String,
    pub holder: String,
    #[serde(with = "timestamp_format")]
    pub enable_at: Timestamp,
    #[serde(with = "timestamp_format")]
    pub expire_at: Timestamp,
}

/// On-disk shape of a record. The slot is the document key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCode {
    code: String,
    user: String,
    #[serde(with = "timestamp_format")]
    enable_at: Timestamp,
    #[serde(with = "timestamp_format")]
    expires_at: Timestamp,
}

impl StoredCode {
    fn from_record(record: &CredentialRecord) -> Self {
        Self {
            code: record.code.clone(),
            user: record.holder.clone(),
            enable_at: record.enable_at,
            expires_at: record.expire_at,
        }
    }

    fn into_record(self, slot: Slot) -> CredentialRecord {
        CredentialRecord {
            slot,
            code: self.code,
            holder: self.user,
            enable_at: self.enable_at,
            expire_at: self.expires_at,
        }
    }
}

/// Durable mapping from slot to [`CredentialRecord`], backed by `lock_codes.json`.
pub struct CredentialStore {
    doc: JsonDocument<StoredCode>,
}

impl CredentialStore {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            doc: JsonDocument::new(layout.codes_file()),
        }
    }

    pub fn list(&self) -> BTreeMap<Slot, CredentialRecord> {
        self.doc
            .read()
            .into_iter()
            .map(|(slot, stored)| (slot, stored.into_record(slot)))
            .collect()
    }

    pub fn get(&self, slot: Slot) -> Option<CredentialRecord> {
        self.doc
            .read()
            .remove(&slot)
            .map(|stored| stored.into_record(slot))
    }

    pub fn upsert(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let stored = StoredCode::from_record(record);
        self.doc.modify(|entries| {
            entries.insert(record.slot, stored);
            true
        })?;
        Ok(())
    }

    /// Remove a slot's record. Returns whether one was present.
    pub fn delete(&self, slot: Slot) -> Result<bool, StoreError> {
        self.doc.modify(|entries| entries.remove(&slot).is_some())
    }

    /// Remove the record for `slot` only if `matches` accepts it. The check
    /// and the removal happen under the document lock.
    pub fn delete_if(
        &self,
        slot: Slot,
        matches: impl FnOnce(&CredentialRecord) -> bool,
    ) -> Result<bool, StoreError> {
        self.doc.modify(|entries| {
            let hit = entries
                .get(&slot)
                .is_some_and(|stored| matches(&stored.clone().into_record(slot)));
            hit && entries.remove(&slot).is_some()
        })
    }

    /// Overwrite the whole document with `records`.
    pub fn replace_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a CredentialRecord>,
    ) -> Result<(), StoreError> {
        let entries = records
            .into_iter()
            .map(|r| (r.slot, StoredCode::from_record(r)))
            .collect();
        self.doc.replace(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_timestamp;
    use std::fs;

    fn test_store() -> (tempfile::TempDir, StoreLayout, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = CredentialStore::new(&layout);
        (dir, layout, store)
    }

    fn record(slot: u16, holder: &str) -> CredentialRecord {
        CredentialRecord {
            slot: Slot::new(slot).unwrap(),
            code: "4821".to_owned(),
            holder: holder.to_owned(),
            enable_at: parse_timestamp("2025-06-01 15:00:00").unwrap(),
            expire_at: parse_timestamp("2025-06-03 11:00:00").unwrap(),
        }
    }

    #[test]
    fn upsert_get_delete() {
        let (_dir, _layout, store) = test_store();
        let rec = record(3, "Guest");
        store.upsert(&rec).unwrap();
        assert_eq!(store.get(rec.slot), Some(rec.clone()));

        assert!(store.delete(rec.slot).unwrap());
        assert!(store.get(rec.slot).is_none());
        assert!(!store.delete(rec.slot).unwrap());
    }

    #[test]
    fn upsert_replaces_existing_slot() {
        let (_dir, _layout, store) = test_store();
        store.upsert(&record(1, "First")).unwrap();
        store.upsert(&record(1, "Second")).unwrap();
        let all = store.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&Slot::new(1).unwrap()].holder, "Second");
    }

    #[test]
    fn file_format_uses_user_and_expires_at() {
        let (_dir, layout, store) = test_store();
        store.upsert(&record(2, "Cleaner")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(layout.codes_file()).unwrap()).unwrap();
        let entry = &raw["2"];
        assert_eq!(entry["code"], "4821");
        assert_eq!(entry["user"], "Cleaner");
        assert_eq!(entry["enable_at"], "2025-06-01 15:00:00");
        assert_eq!(entry["expires_at"], "2025-06-03 11:00:00");
    }

    #[test]
    fn reads_document_written_by_hand() {
        let (_dir, layout, store) = test_store();
        fs::write(
            layout.codes_file(),
            r#"{
    "5": {
        "code": "1234",
        "user": "Dog walker",
        "enable_at": "2025-01-01 08:00:00",
        "expires_at": "2025-01-01 09:00:00"
    }
}"#,
        )
        .unwrap();
        let rec = store.get(Slot::new(5).unwrap()).unwrap();
        assert_eq!(rec.holder, "Dog walker");
        assert_eq!(rec.code, "1234");
    }

    #[test]
    fn delete_if_leaves_a_different_record_alone() {
        let (_dir, _layout, store) = test_store();
        let current = record(1, "New");
        store.upsert(&current).unwrap();

        assert!(!store.delete_if(current.slot, |r| r.holder == "Old").unwrap());
        assert_eq!(store.get(current.slot), Some(current.clone()));

        assert!(store.delete_if(current.slot, |r| r.holder == "New").unwrap());
        assert!(store.get(current.slot).is_none());
        assert!(!store.delete_if(current.slot, |_| true).unwrap());
    }

    #[test]
    fn replace_all_drops_unlisted_slots() {
        let (_dir, _layout, store) = test_store();
        store.upsert(&record(1, "a")).unwrap();
        store.upsert(&record(2, "b")).unwrap();
        let keep = record(2, "b");
        store.replace_all([&keep]).unwrap();
        let slots: Vec<u16> = store.list().keys().map(|s| s.get()).collect();
        assert_eq!(slots, vec![2]);
    }
}
