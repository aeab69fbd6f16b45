use crate::{DeviceError, DeviceGateway, LiveCodes};
use latchkey_store::Slot;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-memory lock used by tests and dry runs.
///
/// Counts every call and can be switched into two failure modes: fully
/// unreachable, or accepting `set_code` without the code ever appearing.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    codes: BTreeMap<Slot, (String, String)>,
    unreachable: bool,
    drop_sets: bool,
    query_calls: usize,
    set_calls: usize,
    delete_calls: usize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-program a code as if it had been added out of band.
    #[must_use]
    pub fn with_live_code(self, slot: Slot, code: &str, holder: &str) -> Self {
        self.inspect()
            .codes
            .insert(slot, (code.to_owned(), holder.to_owned()));
        self
    }

    fn inspect(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, DeviceError> {
        let state = self
            .state
            .lock()
            .map_err(|e| DeviceError::Protocol(format!("mutex poisoned: {e}")))?;
        if state.unreachable {
            return Err(DeviceError::Unreachable("mock device offline".to_owned()));
        }
        Ok(state)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inspect().unreachable = unreachable;
    }

    /// Accept `set_code` calls but never apply them.
    pub fn set_drop_sets(&self, drop_sets: bool) {
        self.inspect().drop_sets = drop_sets;
    }

    /// Current codes, without counting as a query.
    pub fn live_codes(&self) -> LiveCodes {
        self.inspect()
            .codes
            .iter()
            .map(|(slot, (_, holder))| (*slot, holder.clone()))
            .collect()
    }

    pub fn code_in(&self, slot: Slot) -> Option<String> {
        self.inspect().codes.get(&slot).map(|(code, _)| code.clone())
    }

    pub fn query_calls(&self) -> usize {
        self.inspect().query_calls
    }

    pub fn set_calls(&self) -> usize {
        self.inspect().set_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.inspect().delete_calls
    }
}

impl DeviceGateway for MockGateway {
    fn query_live_codes(&self) -> Result<LiveCodes, DeviceError> {
        let mut state = self.lock()?;
        state.query_calls += 1;
        Ok(state
            .codes
            .iter()
            .map(|(slot, (_, holder))| (*slot, holder.clone()))
            .collect())
    }

    fn set_code(&self, slot: Slot, code: &str, holder: &str) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.set_calls += 1;
        if !state.drop_sets {
            state
                .codes
                .insert(slot, (code.to_owned(), holder.to_owned()));
        }
        Ok(())
    }

    fn delete_code(&self, slot: Slot) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.delete_calls += 1;
        state.codes.remove(&slot);
        Ok(())
    }
}
