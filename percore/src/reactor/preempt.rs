use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The preemption monitor: one word in memory that user code samples at
/// cooperation points. Non-zero means "yield at the next opportunity".
///
/// The word is written by the quota-timer tick (from the backend), by
/// `add_high_priority_task`, and by the reactor itself; it is reset at
/// every iteration boundary so each task batch gets a fresh budget.
pub struct PreemptionMonitor {
    word: AtomicU32,
}

impl PreemptionMonitor {
    pub(crate) fn new() -> Arc<PreemptionMonitor> {
        Arc::new(PreemptionMonitor {
            word: AtomicU32::new(0),
        })
    }

    #[inline(always)]
    pub fn need_preempt(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }

    #[inline(always)]
    pub fn request_preemption(&self) {
        self.word.store(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn reset(&self) {
        self.word.store(0, Ordering::Relaxed);
    }

    /// Address of the word, published at startup so backends can set it
    /// from their tick path without going through the reactor.
    pub fn as_ptr(&self) -> *const AtomicU32 {
        &self.word as *const AtomicU32
    }
}

thread_local! {
    static MONITOR: Cell<*const AtomicU32> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn publish_monitor(m: &PreemptionMonitor) {
    MONITOR.with(|p| p.set(m.as_ptr()));
}

pub(crate) fn unpublish_monitor() {
    MONITOR.with(|p| p.set(std::ptr::null()));
}

/// Cheap cooperative check for user code; false off-shard.
#[inline(always)]
pub fn need_preempt() -> bool {
    MONITOR.with(|p| {
        let ptr = p.get();
        // Published once at reactor startup and cleared at shutdown; a
        // non-null pointer always refers to the live monitor.
        !ptr.is_null() && unsafe { (*ptr).load(Ordering::Relaxed) != 0 }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    // The monitor must stay a single word: backends store a raw pointer
    // to it and signal handlers poke it with one relaxed store.
    const_assert_eq!(std::mem::size_of::<PreemptionMonitor>(), 4);

    #[test]
    fn request_and_reset() {
        let m = PreemptionMonitor::new();
        assert!(!m.need_preempt());
        m.request_preemption();
        assert!(m.need_preempt());
        m.reset();
        assert!(!m.need_preempt());
    }

    #[test]
    fn published_monitor_feeds_free_function() {
        let m = PreemptionMonitor::new();
        publish_monitor(&m);
        assert!(!need_preempt());
        m.request_preemption();
        assert!(need_preempt());
        unpublish_monitor();
        assert!(!need_preempt());
        m.reset();
    }
}
