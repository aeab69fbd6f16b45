use crate::{fsync_dir, Slot, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A whole-file JSON object keyed by slot number.
///
/// Every read-modify-write runs under one mutex, and every write goes through
/// a temp file in the same directory followed by a rename, so a reader never
/// observes a half-written document.
pub(crate) struct JsonDocument<T> {
    path: PathBuf,
    guard: Mutex<()>,
    _entry: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonDocument<T> {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
            _entry: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }

    // The mutex guards no data, so a poisoned lock carries nothing stale.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read(&self) -> BTreeMap<Slot, T> {
        let _held = self.lock();
        self.load()
    }

    /// Apply `f` to the current entries and write them back if it reports a change.
    pub(crate) fn modify(
        &self,
        f: impl FnOnce(&mut BTreeMap<Slot, T>) -> bool,
    ) -> Result<bool, StoreError> {
        let _held = self.lock();
        let mut entries = self.load();
        let changed = f(&mut entries);
        if changed {
            self.write(&entries)?;
        }
        Ok(changed)
    }

    pub(crate) fn replace(&self, entries: &BTreeMap<Slot, T>) -> Result<(), StoreError> {
        let _held = self.lock();
        self.write(entries)
    }

    fn load(&self) -> BTreeMap<Slot, T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                self.report_corrupt(&e.to_string());
                return BTreeMap::new();
            }
        };

        let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                self.report_corrupt(&e.to_string());
                return BTreeMap::new();
            }
        };

        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let slot = match key.parse::<Slot>() {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("{}: skipping entry '{key}': {e}", self.path.display());
                    continue;
                }
            };
            match serde_json::from_value::<T>(value) {
                Ok(entry) => {
                    entries.insert(slot, entry);
                }
                Err(e) => {
                    warn!("{}: skipping corrupted entry for slot {slot}: {e}", self.path.display());
                }
            }
        }
        entries
    }

    fn report_corrupt(&self, reason: &str) {
        let err = StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: reason.to_owned(),
        };
        warn!("{err}; treating as empty");
    }

    fn write(&self, entries: &BTreeMap<Slot, T>) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(entries)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        debug!("wrote {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}
