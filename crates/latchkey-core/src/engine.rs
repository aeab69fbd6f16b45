use crate::allocator::{merge_view, SlotAllocator, SlotView};
use crate::clock::Clock;
use crate::scheduler::{ActionId, ScheduledAction, Scheduler};
use crate::CoreError;
use latchkey_device::DeviceGateway;
use latchkey_store::{
    format_timestamp, CredentialRecord, CredentialStore, FailureLog, FailureRecord, Slot,
    StoreLayout, Timestamp,
};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

/// A code accepted by [`LifecycleEngine::create_code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedCode {
    pub slot: Slot,
    pub code: String,
}

/// How an activation attempt ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The lock already had the slot; nothing was sent.
    AlreadyLive,
    /// The code was sent and the lock now reports it.
    Confirmed,
}

/// Merged listing returned by [`LifecycleEngine::list_codes`].
#[derive(Debug, Clone, Serialize)]
pub struct CodeListing {
    pub device_reachable: bool,
    pub codes: Vec<SlotView>,
}

/// What startup reconciliation did, slot by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Past their expiry; purged from the lock and the store.
    pub expired: Vec<Slot>,
    /// Inside their window; activated immediately.
    pub caught_up: Vec<Slot>,
    /// Not yet enabled; activation re-armed.
    pub rearmed: Vec<Slot>,
}

struct EngineInner {
    codes: CredentialStore,
    failures: FailureLog,
    gateway: Arc<dyn DeviceGateway>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    allocator: SlotAllocator,
    /// Held across slot choice and persistence so two creates never pick the same slot.
    allocation: Mutex<()>,
}

/// Owns the lock-code lifecycle: allocation, persistence, timed activation and
/// expiry, verification, manual deletion, and startup reconciliation.
///
/// Cloning yields another handle to the same engine. Scheduled handlers hold
/// only a weak reference, so dropping every handle tears the engine down.
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

pub fn generate_code() -> String {
    rand::thread_rng().gen_range(1000..=9999).to_string()
}

fn validate_holder(holder: &str) -> Result<String, CoreError> {
    let trimmed = holder.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidHolder("holder name must not be empty".to_owned()));
    }
    // The hub's setCode command takes comma-separated arguments.
    if trimmed.contains(',') {
        return Err(CoreError::InvalidHolder(format!(
            "holder name must not contain commas: '{trimmed}'"
        )));
    }
    Ok(trimmed.to_owned())
}

impl LifecycleEngine {
    pub fn new(
        layout: &StoreLayout,
        gateway: Arc<dyn DeviceGateway>,
        scheduler: Scheduler,
        clock: Arc<dyn Clock>,
        slot_count: u16,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                codes: CredentialStore::new(layout),
                failures: FailureLog::new(layout),
                gateway,
                scheduler,
                clock,
                allocator: SlotAllocator::new(slot_count),
                allocation: Mutex::new(()),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn capacity(&self) -> u16 {
        self.inner.allocator.capacity()
    }

    /// Allocate a slot, persist a new random code for `holder`, and schedule
    /// its activation at `enable_at` and removal at `expire_at`.
    ///
    /// Returns once the record is stored and both actions are registered;
    /// activation itself happens later on the scheduler.
    pub fn create_code(
        &self,
        holder: &str,
        enable_at: Timestamp,
        expire_at: Timestamp,
    ) -> Result<CreatedCode, CoreError> {
        let holder = validate_holder(holder)?;
        if enable_at >= expire_at {
            return Err(CoreError::InvalidWindow {
                enable_at: format_timestamp(&enable_at),
                expire_at: format_timestamp(&expire_at),
            });
        }

        let record = {
            let _held = self
                .inner
                .allocation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = self
                .inner
                .allocator
                .next_free_slot(&self.inner.codes, self.inner.gateway.as_ref())?
                .ok_or(CoreError::NoSlotAvailable {
                    capacity: self.inner.allocator.capacity(),
                })?;
            let record = CredentialRecord {
                slot,
                code: generate_code(),
                holder,
                enable_at,
                expire_at,
            };
            self.inner.codes.upsert(&record)?;
            record
        };

        self.schedule_activation(&record);
        self.schedule_expiry(&record);
        info!(
            "lock code scheduled for {} in slot {} ({} to {})",
            record.holder, record.slot, record.enable_at, record.expire_at
        );

        Ok(CreatedCode {
            slot: record.slot,
            code: record.code,
        })
    }

    fn schedule_activation(&self, record: &CredentialRecord) {
        let weak = Arc::downgrade(&self.inner);
        let (slot, code, holder) = (record.slot, record.code.clone(), record.holder.clone());
        self.inner.scheduler.schedule(
            ActionId::activate(slot),
            record.enable_at,
            Box::new(move || match upgrade(&weak) {
                Some(engine) => engine.handle_activate(slot, &code, &holder).map(|_| ()),
                None => Ok(()),
            }),
        );
    }

    fn schedule_expiry(&self, record: &CredentialRecord) {
        let weak = Arc::downgrade(&self.inner);
        let (slot, code, expire_at) = (record.slot, record.code.clone(), record.expire_at);
        self.inner.scheduler.schedule(
            ActionId::expire(slot),
            expire_at,
            Box::new(move || match upgrade(&weak) {
                Some(engine) => engine.expire_scheduled(slot, &code, expire_at),
                None => Ok(()),
            }),
        );
    }

    /// Push a code to the lock and confirm it took.
    ///
    /// If the lock already reports the slot, nothing is sent. Otherwise the
    /// code is sent and the lock is queried again; a slot that does not show
    /// up is recorded in the failure log. Nothing is retried.
    pub fn handle_activate(
        &self,
        slot: Slot,
        code: &str,
        holder: &str,
    ) -> Result<Activation, CoreError> {
        let gateway = &self.inner.gateway;
        match gateway.query_live_codes() {
            Ok(live) if live.contains_key(&slot) => {
                info!("lock code for slot {slot} already present; skipping");
                return Ok(Activation::AlreadyLive);
            }
            Ok(_) => {}
            Err(e) => warn!("could not read lock state before activating slot {slot}: {e}"),
        }

        if let Err(e) = gateway.set_code(slot, code, holder) {
            self.record_failure(
                slot,
                code,
                holder,
                format!("failed to enable lock code for {holder} in slot {slot}: {e}"),
            );
            return Err(e.into());
        }

        let reason = match gateway.query_live_codes() {
            Ok(live) if live.contains_key(&slot) => {
                info!("lock code enabled for {holder} in slot {slot}");
                return Ok(Activation::Confirmed);
            }
            Ok(_) => format!(
                "failed to enable lock code for {holder} in slot {slot}: code not found in device response"
            ),
            Err(e) => format!(
                "failed to enable lock code for {holder} in slot {slot}: could not verify: {e}"
            ),
        };
        self.record_failure(slot, code, holder, reason.clone());
        Err(CoreError::ActivationUnconfirmed { slot, reason })
    }

    fn record_failure(&self, slot: Slot, code: &str, holder: &str, error: String) {
        warn!("{error}");
        let record = FailureRecord {
            slot,
            code: code.to_owned(),
            holder: holder.to_owned(),
            error,
            occurred_at: self.inner.clock.now(),
        };
        if let Err(e) = self.inner.failures.append(&record) {
            warn!("could not write failure record for slot {slot}: {e}");
        }
    }

    /// Remove a slot's code from the lock, then drop its record.
    ///
    /// On a device error the record is kept and the error returned; the
    /// failure log is not touched.
    pub fn handle_expire(&self, slot: Slot) -> Result<(), CoreError> {
        self.remove_from_lock(slot)?;
        if self.inner.codes.delete(slot)? {
            debug!("dropped record for slot {slot}");
        }
        Ok(())
    }

    /// Expiry as armed by the scheduler. Acts only while the slot still holds
    /// the record the action was armed for, so a late handler cannot remove
    /// a code that was revoked and reissued in the same slot meanwhile.
    fn expire_scheduled(
        &self,
        slot: Slot,
        code: &str,
        expire_at: Timestamp,
    ) -> Result<(), CoreError> {
        let armed_for = |r: &CredentialRecord| r.code == code && r.expire_at == expire_at;
        if !self.inner.codes.get(slot).is_some_and(|r| armed_for(&r)) {
            info!("slot {slot} no longer holds the expiring code; skipping");
            return Ok(());
        }
        self.remove_from_lock(slot)?;
        if self.inner.codes.delete_if(slot, armed_for)? {
            debug!("dropped record for slot {slot}");
        } else {
            info!("slot {slot} was reissued while expiring; keeping the new record");
        }
        Ok(())
    }

    fn remove_from_lock(&self, slot: Slot) -> Result<(), CoreError> {
        if let Err(e) = self.inner.gateway.delete_code(slot) {
            warn!("failed to remove lock code from slot {slot}: {e}");
            return Err(e.into());
        }
        info!("lock code removed from slot {slot}");
        Ok(())
    }

    /// Revoke a slot now: delete it on the lock, cancel its pending actions,
    /// and forget its record and any failure. Unknown slots are not an error.
    ///
    /// Local state is cleared even when the lock cannot be reached, in which
    /// case the device error is returned so the caller can retry; the code
    /// then shows up as an unmanaged live slot.
    pub fn delete_code(&self, slot: Slot) -> Result<(), CoreError> {
        let device = self.inner.gateway.delete_code(slot);

        self.inner.scheduler.cancel(ActionId::activate(slot));
        self.inner.scheduler.cancel(ActionId::expire(slot));
        self.inner.codes.delete(slot)?;
        if self.inner.failures.delete(slot)? {
            debug!("cleared failure record for slot {slot}");
        }

        match device {
            Ok(()) => {
                info!("lock code in slot {slot} deleted");
                Ok(())
            }
            Err(e) => {
                warn!("slot {slot} cleared locally but the lock did not confirm: {e}");
                Err(e.into())
            }
        }
    }

    /// Rebuild the schedule from the store after a restart.
    ///
    /// Records past expiry are deleted from the lock and dropped from the
    /// store even when the lock does not answer. Records inside their window
    /// are activated immediately; records not yet enabled get their
    /// activation re-armed. Every surviving record gets its expiry re-armed,
    /// and the store is rewritten with only the survivors.
    pub fn reconcile_on_startup(&self) -> Result<ReconcileReport, CoreError> {
        let now = self.inner.clock.now();
        let records = self.inner.codes.list();
        let mut report = ReconcileReport::default();
        let mut kept = Vec::with_capacity(records.len());

        for (slot, record) in records {
            if record.expire_at <= now {
                info!("removing expired lock code in slot {slot}");
                if let Err(e) = self.remove_from_lock(slot) {
                    warn!("expired code in slot {slot} may still be on the lock: {e}");
                }
                report.expired.push(slot);
                continue;
            }

            if record.enable_at <= now {
                if let Err(e) = self.handle_activate(slot, &record.code, &record.holder) {
                    warn!("catch-up activation for slot {slot} failed: {e}");
                }
                report.caught_up.push(slot);
            } else {
                self.schedule_activation(&record);
                info!("re-scheduled enablement for slot {slot} at {}", record.enable_at);
                report.rearmed.push(slot);
            }

            self.schedule_expiry(&record);
            info!("re-scheduled expiration for slot {slot} at {}", record.expire_at);
            kept.push(record);
        }

        self.inner.codes.replace_all(&kept)?;
        Ok(report)
    }

    /// Store records merged with what the lock reports. Falls back to the
    /// store alone, flagged, when the lock cannot be read.
    pub fn list_codes(&self) -> CodeListing {
        let stored = self.inner.codes.list();
        match self.inner.gateway.query_live_codes() {
            Ok(live) => CodeListing {
                device_reachable: true,
                codes: merge_view(&stored, Some(&live)),
            },
            Err(e) => {
                warn!("listing without device state: {e}");
                CodeListing {
                    device_reachable: false,
                    codes: merge_view(&stored, None),
                }
            }
        }
    }

    pub fn get_code(&self, slot: Slot) -> Option<CredentialRecord> {
        self.inner.codes.get(slot)
    }

    pub fn failed_codes(&self) -> Vec<FailureRecord> {
        self.inner.failures.list().into_values().collect()
    }

    pub fn scheduled_actions(&self) -> Vec<ScheduledAction> {
        self.inner.scheduler.list()
    }
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<LifecycleEngine> {
    weak.upgrade().map(|inner| LifecycleEngine { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use latchkey_device::MockGateway;
    use latchkey_store::parse_timestamp;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        gateway: Arc<MockGateway>,
        engine: LifecycleEngine,
    }

    fn harness(slot_count: u16) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let clock = Arc::new(ManualClock::new(
            parse_timestamp("2025-10-01 12:00:00").unwrap(),
        ));
        let gateway = Arc::new(MockGateway::new());
        let scheduler = Scheduler::new(clock.clone());
        let engine = LifecycleEngine::new(
            &layout,
            gateway.clone(),
            scheduler,
            clock.clone(),
            slot_count,
        );
        Harness {
            _dir: dir,
            clock,
            gateway,
            engine,
        }
    }

    fn slot(n: u16) -> Slot {
        Slot::new(n).unwrap()
    }

    #[test]
    fn generated_codes_are_four_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 4);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
            assert!(!code.starts_with('0'));
        }
    }

    #[test]
    fn holder_validation() {
        assert_eq!(validate_holder("  Guest ").unwrap(), "Guest");
        assert!(validate_holder("   ").is_err());
        assert!(validate_holder("Smith, J").is_err());
    }

    #[test]
    fn create_persists_and_schedules_both_actions() {
        let h = harness(30);
        let now = h.clock.now();
        let created = h
            .engine
            .create_code("Guest", now + Duration::hours(1), now + Duration::hours(5))
            .unwrap();
        assert_eq!(created.slot, slot(1));

        let record = h.engine.get_code(created.slot).unwrap();
        assert_eq!(record.code, created.code);
        assert_eq!(record.holder, "Guest");

        let sched = h.engine.scheduler();
        assert_eq!(
            sched.due_at(ActionId::activate(created.slot)),
            Some(now + Duration::hours(1))
        );
        assert_eq!(
            sched.due_at(ActionId::expire(created.slot)),
            Some(now + Duration::hours(5))
        );
        assert_eq!(sched.len(), 2);
        // nothing reaches the lock until the activation fires
        assert_eq!(h.gateway.set_calls(), 0);
    }

    #[test]
    fn create_rejects_inverted_or_empty_window() {
        let h = harness(30);
        let now = h.clock.now();
        for (enable, expire) in [(now, now), (now + Duration::hours(2), now + Duration::hours(1))] {
            let err = h.engine.create_code("Guest", enable, expire).unwrap_err();
            assert!(matches!(err, CoreError::InvalidWindow { .. }), "got {err}");
        }
        assert!(h.engine.list_codes().codes.is_empty());
        assert!(h.engine.scheduler().is_empty());
        assert_eq!(h.gateway.query_calls(), 0);
    }

    #[test]
    fn create_fails_when_slots_exhausted() {
        let h = harness(2);
        let now = h.clock.now();
        h.engine
            .create_code("a", now + Duration::hours(1), now + Duration::hours(2))
            .unwrap();
        h.gateway.set_code(slot(2), "9999", "Owner").unwrap();

        let err = h
            .engine
            .create_code("b", now + Duration::hours(1), now + Duration::hours(2))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSlotAvailable { capacity: 2 }));
        assert_eq!(h.engine.list_codes().codes.iter().filter(|c| c.managed).count(), 1);
        assert_eq!(h.engine.scheduler().len(), 2);
    }

    #[test]
    fn activation_is_idempotent() {
        let h = harness(30);
        let first = h.engine.handle_activate(slot(3), "1234", "Guest").unwrap();
        let second = h.engine.handle_activate(slot(3), "1234", "Guest").unwrap();
        assert_eq!(first, Activation::Confirmed);
        assert_eq!(second, Activation::AlreadyLive);
        assert_eq!(h.gateway.set_calls(), 1);
    }

    #[test]
    fn unconfirmed_activation_is_logged_not_retried() {
        let h = harness(30);
        let now = h.clock.now();
        let created = h
            .engine
            .create_code("Guest", now, now + Duration::hours(1))
            .unwrap();
        h.gateway.set_drop_sets(true);

        assert_eq!(h.engine.scheduler().run_due(), 1);

        let failures = h.engine.failed_codes();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].slot, created.slot);
        assert_eq!(failures[0].code, created.code);
        assert!(!failures[0].error.is_empty());
        assert_eq!(failures[0].occurred_at, now);
        // the record stays; only expiry remains scheduled
        assert!(h.engine.get_code(created.slot).is_some());
        assert_eq!(h.engine.scheduler().len(), 1);
        assert_eq!(h.gateway.set_calls(), 1);
    }

    #[test]
    fn unreachable_set_records_failure() {
        let h = harness(30);
        h.gateway.set_unreachable(true);
        let err = h.engine.handle_activate(slot(1), "1234", "Guest").unwrap_err();
        assert!(err.is_gateway_unreachable());
        assert_eq!(h.engine.failed_codes().len(), 1);
    }

    #[test]
    fn expire_keeps_record_when_device_fails() {
        let h = harness(30);
        let now = h.clock.now();
        let created = h
            .engine
            .create_code("Guest", now, now + Duration::hours(1))
            .unwrap();
        h.gateway.set_unreachable(true);
        assert!(h.engine.handle_expire(created.slot).is_err());
        assert!(h.engine.get_code(created.slot).is_some());
        assert!(h.engine.failed_codes().is_empty());

        h.gateway.set_unreachable(false);
        h.engine.handle_expire(created.slot).unwrap();
        assert!(h.engine.get_code(created.slot).is_none());
    }

    #[test]
    fn delete_cancels_and_clears() {
        let h = harness(30);
        let now = h.clock.now();
        let created = h
            .engine
            .create_code("Guest", now, now + Duration::hours(1))
            .unwrap();
        h.gateway.set_drop_sets(true);
        h.engine.scheduler().run_due();
        assert_eq!(h.engine.failed_codes().len(), 1);

        h.engine.delete_code(created.slot).unwrap();
        assert!(h.engine.scheduler().is_empty());
        assert!(h.engine.failed_codes().is_empty());
        assert!(h.engine.get_code(created.slot).is_none());

        // deleting again, or a slot never used, is fine
        h.engine.delete_code(created.slot).unwrap();
        h.engine.delete_code(slot(29)).unwrap();
    }

    #[test]
    fn delete_with_unreachable_device_still_clears_local_state() {
        let h = harness(30);
        let now = h.clock.now();
        let created = h
            .engine
            .create_code("Guest", now + Duration::hours(1), now + Duration::hours(2))
            .unwrap();
        h.gateway.set_unreachable(true);
        let err = h.engine.delete_code(created.slot).unwrap_err();
        assert!(err.is_gateway_unreachable());
        assert!(h.engine.get_code(created.slot).is_none());
        assert!(h.engine.scheduler().is_empty());
    }

    #[test]
    fn list_falls_back_to_store_when_device_down() {
        let h = harness(30);
        let now = h.clock.now();
        h.engine
            .create_code("Guest", now + Duration::hours(1), now + Duration::hours(2))
            .unwrap();
        h.gateway.set_unreachable(true);
        let listing = h.engine.list_codes();
        assert!(!listing.device_reachable);
        assert_eq!(listing.codes.len(), 1);
        assert_eq!(listing.codes[0].live, None);
    }

    #[test]
    fn handlers_outliving_engine_are_noops() {
        let h = harness(30);
        let now = h.clock.now();
        h.engine
            .create_code("Guest", now, now + Duration::hours(1))
            .unwrap();
        let scheduler = h.engine.scheduler().clone();
        drop(h.engine);
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(h.gateway.set_calls(), 0);
    }
}
