use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::sched::{current_scheduling_group, SchedulingGroup};
use crate::shard;

/// Which clock a timer is tracked against.
///
/// `Steady` is the high-resolution clock backing most timers, `Lowres` is
/// refreshed once per reactor iteration at tens-of-milliseconds
/// granularity, and `Manual` only moves when a test advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Steady,
    Lowres,
    Manual,
}

pub(crate) struct TimerInner {
    pub(crate) source: ClockSource,
    pub(crate) group: Cell<SchedulingGroup>,
    pub(crate) deadline: Cell<Instant>,
    pub(crate) period: Cell<Option<Duration>>,
    pub(crate) armed: Cell<bool>,
    pub(crate) queued: Cell<bool>,
    /// Sort key inside a `TimerSet`, assigned on first queueing.
    id: Cell<u64>,
    pub(crate) callback: RefCell<Option<Box<dyn FnMut()>>>,
}

/// An ordered store of pending timers for one clock source.
///
/// Keyed by `(deadline, id)` so timers firing at the same instant keep a
/// stable relative order.
pub(crate) struct TimerSet {
    next_id: u64,
    timers: BTreeMap<(Instant, u64), Rc<TimerInner>>,
}

impl TimerSet {
    pub(crate) fn new() -> TimerSet {
        TimerSet {
            next_id: 0,
            timers: BTreeMap::new(),
        }
    }

    /// Adds `t`; returns true iff `t` is the new earliest timer.
    pub(crate) fn insert(&mut self, t: Rc<TimerInner>) -> bool {
        self.next_id += 1;
        t.id.set(self.next_id);
        t.queued.set(true);
        let key = (t.deadline.get(), self.next_id);
        self.timers.insert(key, t);
        self.timers
            .first_key_value()
            .map(|(first, _)| *first == key)
            .unwrap_or(false)
    }

    pub(crate) fn remove(&mut self, t: &TimerInner) {
        if t.queued.replace(false) {
            self.timers.remove(&(t.deadline.get(), t.id.get()));
        }
    }

    /// Dequeues and returns every timer with deadline ≤ `now`, in deadline
    /// order. Callers run the callbacks and handle periodic re-arm.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Rc<TimerInner>> {
        let mut expired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let t = entry.remove();
            t.queued.set(false);
            expired.push(t);
        }
        expired
    }

    pub(crate) fn get_next_timeout(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(when, _)| *when)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

/// A one-shot or periodic timer bound to the local shard's reactor.
///
/// The callback runs on the reactor in the scheduling group that was
/// current when the timer was created.
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn new(f: impl FnMut() + 'static) -> Timer {
        Timer::with_source(ClockSource::Steady, f)
    }

    pub fn new_lowres(f: impl FnMut() + 'static) -> Timer {
        Timer::with_source(ClockSource::Lowres, f)
    }

    pub fn new_manual(f: impl FnMut() + 'static) -> Timer {
        Timer::with_source(ClockSource::Manual, f)
    }

    fn with_source(source: ClockSource, f: impl FnMut() + 'static) -> Timer {
        Timer {
            inner: Rc::new(TimerInner {
                source,
                group: Cell::new(current_scheduling_group()),
                deadline: Cell::new(Instant::now()),
                period: Cell::new(None),
                armed: Cell::new(false),
                queued: Cell::new(false),
                id: Cell::new(0),
                callback: RefCell::new(Some(Box::new(f))),
            }),
        }
    }

    /// Arms for an absolute deadline. A deadline already in the past fires
    /// on the next reactor iteration.
    ///
    /// # Panics
    ///
    /// Panics if the timer is already armed.
    pub fn arm(&self, at: Instant) {
        assert!(!self.inner.armed.get(), "timer already armed");
        self.inner.deadline.set(at);
        self.inner.period.set(None);
        self.inner.armed.set(true);
        shard::with_reactor(|r| r.queue_timer(self.inner.clone()));
    }

    pub fn arm_after(&self, d: Duration) {
        self.arm(shard::with_reactor(|r| r.now(self.inner.source)) + d);
    }

    /// Arms to fire every `period`, first firing one period from now.
    pub fn arm_periodic(&self, period: Duration) {
        assert!(!self.inner.armed.get(), "timer already armed");
        let now = shard::with_reactor(|r| r.now(self.inner.source));
        self.inner.deadline.set(now + period);
        self.inner.period.set(Some(period));
        self.inner.armed.set(true);
        shard::with_reactor(|r| r.queue_timer(self.inner.clone()));
    }

    /// Cancels the timer. Safe to call from inside the timer's own
    /// callback, in which case a periodic timer is not re-armed.
    pub fn cancel(&self) {
        self.inner.armed.set(false);
        if self.inner.queued.get() {
            shard::with_reactor(|r| r.dequeue_timer(&self.inner));
        }
    }

    pub fn armed(&self) -> bool {
        self.inner.armed.get()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.inner.queued.get() && shard::reactor_running() {
            shard::with_reactor(|r| r.dequeue_timer(&self.inner));
        }
    }
}
