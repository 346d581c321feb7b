use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use crate::error::Error;
use crate::future::{channel, Future, Promise};

struct Waiter {
    units: usize,
    deadline: Option<Instant>,
    promise: Promise<()>,
}

struct Inner {
    count: Cell<usize>,
    waiters: RefCell<VecDeque<Waiter>>,
}

/// Shard-local counting semaphore with optional per-wait deadlines.
///
/// Grants are strictly FIFO: a large waiter at the head blocks smaller
/// waiters behind it, which is what keeps cross-shard submitters fair.
/// Deadlines are lazy; the owner calls [`reap_expired`](Semaphore::reap_expired)
/// from a poller to fail timed-out waits.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<Inner>,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            inner: Rc::new(Inner {
                count: Cell::new(count),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.count.get()
    }

    pub fn waiters(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    pub fn try_wait(&self, units: usize) -> bool {
        let available = self.inner.count.get();
        if self.inner.waiters.borrow().is_empty() && available >= units {
            self.inner.count.set(available - units);
            true
        } else {
            false
        }
    }

    pub fn wait(&self, units: usize) -> Future<()> {
        self.wait_until(units, None)
    }

    /// Acquires `units`, failing with [`Error::DeadlineExceeded`] if the
    /// deadline elapses before the grant.
    pub fn wait_until(&self, units: usize, deadline: Option<Instant>) -> Future<()> {
        if self.try_wait(units) {
            return Future::ready(());
        }
        let (promise, future) = channel();
        self.inner.waiters.borrow_mut().push_back(Waiter {
            units,
            deadline,
            promise,
        });
        future
    }

    pub fn signal(&self, units: usize) {
        self.inner.count.set(self.inner.count.get() + units);
        self.grant();
    }

    /// Fails every waiter whose deadline is at or before `now`.
    pub fn reap_expired(&self, now: Instant) {
        let expired: Vec<Waiter> = {
            let mut waiters = self.inner.waiters.borrow_mut();
            let mut keep = VecDeque::with_capacity(waiters.len());
            let mut expired = Vec::new();
            for w in waiters.drain(..) {
                match w.deadline {
                    Some(d) if d <= now => expired.push(w),
                    _ => keep.push_back(w),
                }
            }
            *waiters = keep;
            expired
        };
        for w in expired {
            w.promise.set_error(Error::DeadlineExceeded);
        }
        // Removing a large head waiter may unblock those behind it.
        self.grant();
    }

    fn grant(&self) {
        loop {
            let granted = {
                let mut waiters = self.inner.waiters.borrow_mut();
                match waiters.front() {
                    Some(head) if head.units <= self.inner.count.get() => {
                        let w = waiters.pop_front().unwrap();
                        self.inner.count.set(self.inner.count.get() - w.units);
                        Some(w)
                    }
                    _ => None,
                }
            };
            match granted {
                // Resolve outside the borrow; the continuation may re-enter.
                Some(w) => w.promise.set_value(()),
                None => break,
            }
        }
    }
}
