//! Absolute-deadline timers.
//!
//! The store keeps timers ordered by `(deadline_ms, seq)`; `seq` is a
//! creation-order tiebreaker. Periodic timers are re-armed at
//! `old_deadline + interval` when drained, without correcting for missed
//! ticks, so a periodic timer that has fallen behind fires again on the
//! very next drain.
//!
//! Operations that can produce a new minimum deadline report it through a
//! `became_front` flag; the reactor maps that flag to its `remind`, which
//! unblocks a wait that was computed against the previous minimum.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel deadline meaning "no timer pending" / "no timeout".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Monotonic-enough millisecond clock used for all deadlines.
pub(crate) fn now_ms() -> u64 {
    // Wall clock, like the original runtime; deadlines are all relative
    // offsets from `now_ms()` taken moments earlier.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

pub(crate) type TimerFn = Arc<dyn Fn() + Send + Sync>;

/// Shared body of one timer entry.
pub(crate) struct TimerCore {
    seq: u64,
    interval_ms: u64,
    periodic: bool,
    func: TimerFn,
    cond: Option<Weak<dyn Any + Send + Sync>>,
    /// Current absolute deadline; mutated only under the store lock.
    deadline_ms: AtomicU64,
}

impl TimerCore {
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    /// Runs the callback, honoring a condition gate if one is attached.
    pub fn fire(&self) {
        if let Some(cond) = &self.cond {
            if cond.upgrade().is_none() {
                return;
            }
        }
        (self.func)();
    }
}

impl std::fmt::Debug for TimerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerCore")
            .field("seq", &self.seq)
            .field("interval_ms", &self.interval_ms)
            .field("periodic", &self.periodic)
            .field("deadline_ms", &self.deadline_ms())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TimerStore {
    next_seq: u64,
    entries: BTreeMap<(u64, u64), Arc<TimerCore>>,
}

impl TimerStore {
    fn insert(&mut self, core: Arc<TimerCore>) -> bool {
        let key = (core.deadline_ms(), core.seq);
        self.entries.insert(key, core);
        // New minimum iff the inserted key is now the first one.
        self.entries.keys().next() == Some(&key)
    }
}

/// Ordered multiset of pending timers.
#[derive(Default)]
pub(crate) struct TimerManager {
    store: Mutex<TimerStore>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a timer due in `interval_ms`. Returns the entry and whether it
    /// became the new minimum deadline.
    pub fn add(
        &self,
        interval_ms: u64,
        func: TimerFn,
        cond: Option<Weak<dyn Any + Send + Sync>>,
        periodic: bool,
    ) -> (Arc<TimerCore>, bool) {
        let mut store = self.store.lock().expect("timer store poisoned");
        let seq = store.next_seq;
        store.next_seq += 1;
        let core = Arc::new(TimerCore {
            seq,
            interval_ms,
            periodic,
            func,
            cond,
            deadline_ms: AtomicU64::new(now_ms() + interval_ms),
        });
        let became_front = store.insert(core.clone());
        (core, became_front)
    }

    /// Removes the timer if it is still pending. Idempotent.
    pub fn cancel(&self, core: &Arc<TimerCore>) {
        let mut store = self.store.lock().expect("timer store poisoned");
        store.entries.remove(&(core.deadline_ms(), core.seq));
    }

    /// Re-arms a pending timer at `now + interval`. Returns
    /// `(found, became_front)`; a timer that already fired (and is not
    /// periodic) is reported as not found.
    pub fn refresh(&self, core: &Arc<TimerCore>) -> (bool, bool) {
        let mut store = self.store.lock().expect("timer store poisoned");
        let Some(core) = store.entries.remove(&(core.deadline_ms(), core.seq)) else {
            return (false, false);
        };
        core.deadline_ms
            .store(now_ms() + core.interval_ms, Ordering::Relaxed);
        let became_front = store.insert(core);
        (true, became_front)
    }

    /// Minimum pending deadline, or [`NO_DEADLINE`].
    pub fn next_deadline_ms(&self) -> u64 {
        let store = self.store.lock().expect("timer store poisoned");
        store
            .entries
            .keys()
            .next()
            .map_or(NO_DEADLINE, |(deadline, _)| *deadline)
    }

    /// Removes and returns every timer with `deadline <= now`. Periodic
    /// timers are re-armed at `deadline + interval`; the second component
    /// reports whether a re-armed timer became the new minimum.
    pub fn drain_expired(&self, now: u64) -> (Vec<Arc<TimerCore>>, bool) {
        let mut store = self.store.lock().expect("timer store poisoned");
        let pending = store.entries.split_off(&(now + 1, 0));
        let expired: Vec<_> = std::mem::replace(&mut store.entries, pending)
            .into_values()
            .collect();

        let mut became_front = false;
        for core in &expired {
            if core.periodic {
                let next = core.deadline_ms() + core.interval_ms;
                core.deadline_ms.store(next, Ordering::Relaxed);
                became_front |= store.insert(core.clone());
            }
        }
        (expired, became_front)
    }

    /// Drops every pending timer.
    pub fn clear(&self) {
        self.store.lock().expect("timer store poisoned").entries.clear();
    }

    /// Number of pending timers.
    pub fn count(&self) -> u32 {
        self.store.lock().expect("timer store poisoned").entries.len() as u32
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

/// Handle to a pending timer, returned by the reactor's `add_timer`.
///
/// Cloning the handle does not clone the timer; all clones refer to the
/// same entry.
#[derive(Clone, Debug)]
pub struct Timer {
    pub(crate) reactor: Weak<crate::reactor::Reactor>,
    pub(crate) core: Arc<TimerCore>,
}

impl Timer {
    /// Cancels the timer if it is still pending. Idempotent.
    pub fn cancel(&self) {
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.cancel_timer(&self.core);
        }
    }

    /// Re-arms the timer at `now + interval`. Returns `false` if it is no
    /// longer pending.
    pub fn refresh(&self) -> bool {
        match self.reactor.upgrade() {
            Some(reactor) => reactor.refresh_timer(&self.core),
            None => false,
        }
    }

    /// The timer's interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.core.interval_ms()
    }

    /// Whether the timer re-arms itself after firing.
    pub fn is_periodic(&self) -> bool {
        self.core.is_periodic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn noop() -> TimerFn {
        Arc::new(|| {})
    }

    #[test]
    fn orders_by_deadline() {
        let mgr = TimerManager::new();
        let (_slow, front) = mgr.add(5000, noop(), None, false);
        assert!(front);
        let (_fast, front) = mgr.add(10, noop(), None, false);
        assert!(front, "earlier deadline must become the new front");
        let (_mid, front) = mgr.add(1000, noop(), None, false);
        assert!(!front);
        assert_eq!(mgr.count(), 3);
        assert!(mgr.next_deadline_ms() <= now_ms() + 10);
    }

    #[test]
    fn drain_returns_expired_and_rearms_periodic() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let (periodic, _) = mgr.add(0, Arc::new(move || { f.fetch_add(1, Ordering::SeqCst); }), None, true);
        let (_oneshot, _) = mgr.add(0, noop(), None, false);
        let (_future, _) = mgr.add(60_000, noop(), None, false);

        let before = periodic.deadline_ms();
        let (expired, _) = mgr.drain_expired(now_ms());
        assert_eq!(expired.len(), 2);
        for core in &expired {
            core.fire();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Periodic timers advance by exactly one interval and stay pending.
        assert!(periodic.deadline_ms() > before || periodic.interval_ms() == 0);
        assert_eq!(mgr.count(), 2);
    }

    #[test]
    fn cancel_and_refresh() {
        let mgr = TimerManager::new();
        let (timer, _) = mgr.add(50_000, noop(), None, false);
        let (found, _) = mgr.refresh(&timer);
        assert!(found);
        mgr.cancel(&timer);
        assert_eq!(mgr.count(), 0);
        // Idempotent.
        mgr.cancel(&timer);
        let (found, _) = mgr.refresh(&timer);
        assert!(!found);
    }

    #[test]
    fn conditional_timer_skips_dead_condition() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        let cond: Arc<dyn Any + Send + Sync> = Arc::new(0u8);
        let f = fired.clone();
        let (gated, _) = mgr.add(
            0,
            Arc::new(move || { f.fetch_add(1, Ordering::SeqCst); }),
            Some(Arc::downgrade(&cond)),
            false,
        );

        gated.fire();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(cond);
        gated.fire();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "dead condition must gate the callback");
    }

    #[test]
    fn equal_deadlines_are_kept_apart() {
        let mgr = TimerManager::new();
        let (_a, _) = mgr.add(1000, noop(), None, false);
        let (_b, _) = mgr.add(1000, noop(), None, false);
        assert_eq!(mgr.count(), 2);
    }
}
