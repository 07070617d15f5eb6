//! The timer set: a deadline-ordered multiset with insert/cancel/reset/expire and
//! clock-rollover detection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};

use crate::now_ms;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque handle returned by [`TimerSet::add`]. Cancellation and reset go through
/// this handle rather than a raw id so callers can't confuse timers across sets.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct TimerHandle(u64);

type Callback = Box<dyn Fn() + Send + Sync>;

struct Entry {
    handle: TimerHandle,
    deadline_ms: u64,
    period_ms: u64,
    recurring: bool,
    callback: Option<Callback>,
    /// Present only for conditional timers (see `add_conditional`). Upgraded just
    /// before firing; if the upgrade fails the fire is silently skipped.
    witness: Option<Weak<dyn std::any::Any + Send + Sync>>,
}

/// Total order key: deadline ascending, then id ascending as a stable tiebreaker.
type OrderKey = (u64, u64);

struct State {
    by_deadline: BTreeMap<OrderKey, Entry>,
    by_handle: std::collections::HashMap<u64, OrderKey>,
    last_now: u64,
}

/// Deadline-ordered timer multiset. One read/write lock guards the ordered structure; a
/// separate, smaller lock guards the rollover-detection clock sample so that sampling
/// `now` never contends with a concurrent insert/cancel.
pub struct TimerSet {
    state: RwLock<State>,
    clock_guard: Mutex<()>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

impl TimerSet {
    pub fn new() -> Self {
        Self::with_clock(now_ms)
    }

    /// Constructs a timer set with an injectable clock, used by tests to exercise
    /// rollover detection deterministically.
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        let start = clock();
        TimerSet {
            state: RwLock::new(State {
                by_deadline: BTreeMap::new(),
                by_handle: std::collections::HashMap::new(),
                last_now: start,
            }),
            clock_guard: Mutex::new(()),
            clock: Box::new(clock),
        }
    }

    fn now(&self) -> u64 {
        let _g = self.clock_guard.lock().unwrap();
        let now = (self.clock)();
        let mut st = self.state.write().unwrap();
        if now + ROLLBACK_THRESHOLD_MS < st.last_now {
            log::warn!(
                "clock rollover detected (now={} previous={}), evicting all timers",
                now,
                st.last_now
            );
            st.by_deadline.clear();
            st.by_handle.clear();
        }
        st.last_now = now;
        now
    }

    /// Adds a one-shot or recurring timer, firing `delay_ms` from now.
    pub fn add(&self, delay_ms: u64, cb: impl Fn() + Send + Sync + 'static, recurring: bool) -> TimerHandle {
        self.add_inner(delay_ms, Box::new(cb), recurring, None)
    }

    /// Adds a conditional timer: fires `cb` only if `witness` can still be upgraded at
    /// firing time. Used by the syscall shim (C6) to avoid firing into a call frame
    /// that has already unwound.
    pub fn add_conditional<T: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        let witness: Weak<dyn std::any::Any + Send + Sync> = witness;
        self.add_inner(delay_ms, Box::new(cb), recurring, Some(witness))
    }

    fn add_inner(
        &self,
        delay_ms: u64,
        cb: Callback,
        recurring: bool,
        witness: Option<Weak<dyn std::any::Any + Send + Sync>>,
    ) -> TimerHandle {
        let now = self.now();
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let handle = TimerHandle(id);
        let deadline = now.saturating_add(delay_ms);
        let key = (deadline, id);
        let entry = Entry {
            handle,
            deadline_ms: deadline,
            period_ms: delay_ms,
            recurring,
            callback: Some(cb),
            witness,
        };
        let mut st = self.state.write().unwrap();
        st.by_deadline.insert(key, entry);
        st.by_handle.insert(id, key);
        handle
    }

    /// Clears the callback and removes from the set; idempotent.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut st = self.state.write().unwrap();
        if let Some(key) = st.by_handle.remove(&handle.0) {
            st.by_deadline.remove(&key);
            true
        } else {
            false
        }
    }

    /// Removes, recomputes the deadline from now (or from the previous deadline if
    /// `from_now` is false), and reinserts, preserving the callback and handle.
    pub fn reset(&self, handle: TimerHandle, ms: u64, from_now: bool) -> bool {
        let now = self.now();
        let mut st = self.state.write().unwrap();
        let Some(key) = st.by_handle.remove(&handle.0) else {
            return false;
        };
        let Some(mut entry) = st.by_deadline.remove(&key) else {
            return false;
        };
        let base = if from_now { now } else { entry.deadline_ms };
        entry.deadline_ms = base.saturating_add(ms);
        entry.period_ms = ms;
        let new_key = (entry.deadline_ms, handle.0);
        st.by_handle.insert(handle.0, new_key);
        st.by_deadline.insert(new_key, entry);
        true
    }

    /// Refreshes the timer to fire `period_ms` from now, keeping its current period.
    pub fn refresh(&self, handle: TimerHandle) -> bool {
        let now = self.now();
        let mut st = self.state.write().unwrap();
        let Some(key) = st.by_handle.remove(&handle.0) else {
            return false;
        };
        let Some(mut entry) = st.by_deadline.remove(&key) else {
            return false;
        };
        entry.deadline_ms = now.saturating_add(entry.period_ms);
        let new_key = (entry.deadline_ms, handle.0);
        st.by_handle.insert(handle.0, new_key);
        st.by_deadline.insert(new_key, entry);
        true
    }

    /// Distance from now to the earliest deadline, `u64::MAX` if empty, 0 if overdue.
    pub fn next_timeout_ms(&self) -> u64 {
        let now = self.now();
        let st = self.state.read().unwrap();
        match st.by_deadline.keys().next() {
            None => u64::MAX,
            Some((deadline, _)) => deadline.saturating_sub(now),
        }
    }

    /// Returns and removes all entries whose deadline has passed, invoking their
    /// callbacks. Recurring entries are reinserted with `deadline = now + period`.
    /// Callback panics are caught and logged without interrupting the loop.
    pub fn drain_expired(&self) {
        let now = self.now();
        let expired: Vec<Entry> = {
            let mut st = self.state.write().unwrap();
            let split_key = (now.saturating_add(1), 0);
            let tail = st.by_deadline.split_off(&split_key);
            let expired_map = std::mem::replace(&mut st.by_deadline, tail);
            for (_, e) in expired_map.iter() {
                st.by_handle.remove(&e.handle.0);
            }
            expired_map.into_values().collect()
        };

        for mut entry in expired {
            let live_cb = match &entry.witness {
                Some(w) => w.upgrade().is_some(),
                None => true,
            };
            if live_cb {
                if let Some(cb) = entry.callback.as_ref() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb()));
                    if let Err(payload) = result {
                        log::error!(
                            "timer {} callback panicked: {:?}",
                            entry.handle.0,
                            payload.downcast_ref::<&str>().copied().unwrap_or("<opaque panic>")
                        );
                    } else {
                        log::trace!("timer {} fired", entry.handle.0);
                    }
                }
            }
            if entry.recurring {
                let now2 = self.now();
                entry.deadline_ms = now2.saturating_add(entry.period_ms);
                let key = (entry.deadline_ms, entry.handle.0);
                let mut st = self.state.write().unwrap();
                st.by_handle.insert(entry.handle.0, key);
                st.by_deadline.insert(key, entry);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().by_deadline.is_empty()
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_is_idempotent() {
        let ts = TimerSet::new();
        let h = ts.add(1000, || {}, false);
        assert!(ts.cancel(h));
        assert!(!ts.cancel(h));
    }

    #[test]
    fn drain_expired_in_deadline_order() {
        let clock = Arc::new(AtomicU32::new(0));
        let c = clock.clone();
        let ts = TimerSet::with_clock(move || c.load(Ordering::SeqCst) as u64);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        ts.add(30, move || o1.lock().unwrap().push(30), false);
        let o2 = order.clone();
        ts.add(10, move || o2.lock().unwrap().push(10), false);
        let o3 = order.clone();
        ts.add(20, move || o3.lock().unwrap().push(20), false);

        clock.store(100, Ordering::SeqCst);
        ts.drain_expired();
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(ts.is_empty());
    }

    #[test]
    fn recurring_timer_reinserted_with_later_deadline() {
        let clock = Arc::new(AtomicU32::new(0));
        let c = clock.clone();
        let ts = TimerSet::with_clock(move || c.load(Ordering::SeqCst) as u64);
        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        ts.add(10, move || { c2.fetch_add(1, Ordering::SeqCst); }, true);

        clock.store(10, Ordering::SeqCst);
        ts.drain_expired();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!ts.is_empty());

        clock.store(20, Ordering::SeqCst);
        ts.drain_expired();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn conditional_timer_skipped_when_witness_dropped() {
        let ts = TimerSet::new();
        let fired = Arc::new(AtomicU32::new(0));
        let witness = Arc::new(());
        let f = fired.clone();
        ts.add_conditional(0, move || { f.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&witness), false);
        drop(witness);
        ts.drain_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clock_rollover_evicts_all_timers() {
        let clock = Arc::new(std::sync::atomic::AtomicU64::new(10_000_000));
        let c = clock.clone();
        let ts = TimerSet::with_clock(move || c.load(Ordering::SeqCst));
        ts.add(1000, || {}, false);
        assert!(!ts.is_empty());

        // Move backwards by more than one hour.
        clock.store(1_000, Ordering::SeqCst);
        ts.drain_expired();
        assert!(ts.is_empty());
    }
}
