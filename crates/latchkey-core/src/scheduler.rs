//! Timed actions keyed by `(kind, slot)`.
//!
//! Each slot has at most one pending activation and one pending expiry.
//! Scheduling an id that is already pending replaces the earlier entry, which
//! is what lets startup reconciliation re-arm actions without double firing.
//!
//! Actions move from pending to fired or cancelled, and both end states drop
//! the entry. A due action is removed from the pending set under the lock
//! before its handler runs, so a concurrent `cancel` either removes it first
//! or finds nothing, and a handler may reschedule its own id.

use crate::clock::Clock;
use crate::CoreError;
use latchkey_store::types::timestamp_format;
use latchkey_store::{Slot, Timestamp};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest the timer thread sleeps without looking at the clock again, so
/// wall-clock jumps (suspend, NTP steps) are noticed promptly.
const MAX_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Activate,
    Expire,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Activate => write!(f, "activate"),
            ActionKind::Expire => write!(f, "expire"),
        }
    }
}

/// Identity of a scheduled action. Displays as `activate:<slot>` / `expire:<slot>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId {
    pub kind: ActionKind,
    pub slot: Slot,
}

impl ActionId {
    pub fn activate(slot: Slot) -> Self {
        Self {
            kind: ActionKind::Activate,
            slot,
        }
    }

    pub fn expire(slot: Slot) -> Self {
        Self {
            kind: ActionKind::Expire,
            slot,
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.slot)
    }
}

impl Serialize for ActionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A pending action as reported by [`Scheduler::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub slot: Slot,
    #[serde(with = "timestamp_format")]
    pub due_at: Timestamp,
}

pub type ActionHandler = Box<dyn FnOnce() -> Result<(), CoreError> + Send + 'static>;

struct PendingAction {
    due_at: Timestamp,
    handler: ActionHandler,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<ActionId, PendingAction>,
    stop: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
}

impl Shared {
    // Handlers never run under this lock, so poisoning cannot leave a
    // half-applied state behind.
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_due(&self, state: &mut SchedulerState) -> Vec<(ActionId, ActionHandler)> {
        let now = self.clock.now();
        let mut due: Vec<(ActionId, Timestamp)> = state
            .pending
            .iter()
            .filter(|(_, p)| p.due_at <= now)
            .map(|(id, p)| (*id, p.due_at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        due.into_iter()
            .filter_map(|(id, _)| state.pending.remove(&id).map(|p| (id, p.handler)))
            .collect()
    }
}

fn fire(id: ActionId, handler: ActionHandler) {
    debug!("firing {id}");
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => debug!("{id} completed"),
        Ok(Err(e)) => warn!("{id} failed: {e}"),
        Err(_) => error!("{id} panicked; scheduler continues"),
    }
}

/// Pending-action registry with an optional background timer thread.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                wake: Condvar::new(),
                clock,
            }),
        }
    }

    /// Register `handler` to run at or after `due_at`, replacing any pending
    /// action with the same id. Returns whether an earlier entry was replaced.
    pub fn schedule(&self, id: ActionId, due_at: Timestamp, handler: ActionHandler) -> bool {
        let replaced = {
            let mut state = self.shared.lock();
            state
                .pending
                .insert(id, PendingAction { due_at, handler })
                .is_some()
        };
        if replaced {
            debug!("rescheduled {id} for {due_at}");
        } else {
            debug!("scheduled {id} for {due_at}");
        }
        self.shared.wake.notify_all();
        replaced
    }

    /// Drop a pending action. Returns whether one was pending.
    pub fn cancel(&self, id: ActionId) -> bool {
        let removed = self.shared.lock().pending.remove(&id).is_some();
        if removed {
            debug!("cancelled {id}");
            self.shared.wake.notify_all();
        }
        removed
    }

    pub fn is_pending(&self, id: ActionId) -> bool {
        self.shared.lock().pending.contains_key(&id)
    }

    pub fn due_at(&self, id: ActionId) -> Option<Timestamp> {
        self.shared.lock().pending.get(&id).map(|p| p.due_at)
    }

    /// Pending actions ordered by due time, then id.
    pub fn list(&self) -> Vec<ScheduledAction> {
        let state = self.shared.lock();
        let mut actions: Vec<ScheduledAction> = state
            .pending
            .iter()
            .map(|(id, p)| ScheduledAction {
                id: *id,
                kind: id.kind,
                slot: id.slot,
                due_at: p.due_at,
            })
            .collect();
        actions.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
        actions
    }

    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every action that is due now, on the calling thread.
    /// Returns how many fired.
    pub fn run_due(&self) -> usize {
        let due = {
            let mut state = self.shared.lock();
            self.shared.take_due(&mut state)
        };
        let fired = due.len();
        for (id, handler) in due {
            fire(id, handler);
        }
        fired
    }

    /// Start the timer thread. Actions fire on that thread, one at a time.
    pub fn start(&self) -> Result<SchedulerHandle, CoreError> {
        self.shared.lock().stop = false;
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("latchkey-scheduler".to_owned())
            .spawn(move || timer_loop(&shared))?;
        info!("scheduler started");
        Ok(SchedulerHandle {
            shared: Arc::clone(&self.shared),
            thread: Some(thread),
        })
    }
}

fn timer_loop(shared: &Shared) {
    loop {
        let due = {
            let mut state = shared.lock();
            loop {
                if state.stop {
                    return;
                }
                let now = shared.clock.now();
                let next = state.pending.values().map(|p| p.due_at).min();
                let wait = match next {
                    Some(at) if at <= now => break,
                    Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP),
                    None => MAX_SLEEP,
                };
                state = shared
                    .wake
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            shared.take_due(&mut state)
        };
        for (id, handler) in due {
            fire(id, handler);
        }
    }
}

/// Running timer thread. Stops (after the action in flight, if any) on
/// [`shutdown`](Self::shutdown) or drop.
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("scheduler thread panicked");
            }
            info!("scheduler stopped");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::Duration as Delta;
    use latchkey_store::parse_timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slot(n: u16) -> Slot {
        Slot::new(n).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(
            parse_timestamp("2025-08-01 09:00:00").unwrap(),
        ));
        let scheduler = Scheduler::new(clock.clone());
        (clock, scheduler)
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> ActionHandler {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn action_id_display() {
        assert_eq!(ActionId::activate(slot(3)).to_string(), "activate:3");
        assert_eq!(ActionId::expire(slot(12)).to_string(), "expire:12");
        assert_ne!(ActionId::activate(slot(1)), ActionId::expire(slot(1)));
    }

    #[test]
    fn fires_only_when_due() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            ActionId::activate(slot(1)),
            clock.now() + Delta::minutes(5),
            counter_handler(&count),
        );

        assert_eq!(scheduler.run_due(), 0);
        clock.advance(Delta::minutes(4));
        assert_eq!(scheduler.run_due(), 0);
        clock.advance(Delta::minutes(1));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());

        clock.advance(Delta::hours(1));
        assert_eq!(scheduler.run_due(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn past_due_fires_on_next_tick() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            ActionId::expire(slot(2)),
            clock.now() - Delta::days(2),
            counter_handler(&count),
        );
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rescheduling_replaces_instead_of_duplicating() {
        let (clock, scheduler) = setup();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let id = ActionId::expire(slot(4));

        assert!(!scheduler.schedule(id, clock.now() + Delta::minutes(10), counter_handler(&first)));
        assert!(scheduler.schedule(id, clock.now() + Delta::minutes(30), counter_handler(&second)));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.due_at(id), Some(clock.now() + Delta::minutes(30)));

        clock.advance(Delta::minutes(10));
        assert_eq!(scheduler.run_due(), 0);
        clock.advance(Delta::minutes(20));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_removes_pending() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let id = ActionId::activate(slot(7));
        scheduler.schedule(id, clock.now(), counter_handler(&count));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.run_due(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn list_is_ordered_by_due_time() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let now = clock.now();
        scheduler.schedule(ActionId::expire(slot(1)), now + Delta::hours(3), counter_handler(&count));
        scheduler.schedule(ActionId::activate(slot(2)), now + Delta::hours(1), counter_handler(&count));
        scheduler.schedule(ActionId::activate(slot(1)), now + Delta::hours(1), counter_handler(&count));

        let ids: Vec<String> = scheduler.list().iter().map(|a| a.id.to_string()).collect();
        assert_eq!(ids, vec!["activate:1", "activate:2", "expire:1"]);

        let json = serde_json::to_value(&scheduler.list()[0]).unwrap();
        assert_eq!(json["id"], "activate:1");
        assert_eq!(json["kind"], "activate");
        assert_eq!(json["slot"], 1);
        assert_eq!(json["due_at"], "2025-08-01 10:00:00");
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_others() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let now = clock.now();
        scheduler.schedule(
            ActionId::activate(slot(1)),
            now,
            Box::new(|| -> Result<(), CoreError> { Err(CoreError::Config("boom".to_owned())) }),
        );
        scheduler.schedule(
            ActionId::activate(slot(2)),
            now,
            Box::new(|| -> Result<(), CoreError> { panic!("handler bug") }),
        );
        scheduler.schedule(ActionId::activate(slot(3)), now, counter_handler(&count));

        assert_eq!(scheduler.run_due(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn handler_can_reschedule_its_own_id() {
        let (clock, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let id = ActionId::expire(slot(5));
        let again_at = clock.now() + Delta::minutes(1);

        let inner_scheduler = scheduler.clone();
        let inner_count = Arc::clone(&count);
        scheduler.schedule(
            id,
            clock.now(),
            Box::new(move || {
                inner_scheduler.schedule(id, again_at, counter_handler(&inner_count));
                Ok(())
            }),
        );

        assert_eq!(scheduler.run_due(), 1);
        assert!(scheduler.is_pending(id));
        clock.advance(Delta::minutes(1));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_thread_fires_past_due_action() {
        let scheduler = Scheduler::new(Arc::new(SystemClock));
        let handle = scheduler.start().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.schedule(
            ActionId::activate(slot(1)),
            SystemClock.now() - Delta::seconds(1),
            Box::new(move || {
                let _ = tx.send(());
                Ok(())
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(scheduler.is_empty());
        handle.shutdown();
    }

    #[test]
    fn timer_thread_picks_up_manual_clock_changes() {
        let (clock, scheduler) = setup();
        let handle = scheduler.start().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.schedule(
            ActionId::expire(slot(9)),
            clock.now() + Delta::hours(2),
            Box::new(move || {
                let _ = tx.send(());
                Ok(())
            }),
        );
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        clock.advance(Delta::hours(2));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(handle);
    }
}
