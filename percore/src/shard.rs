use std::cell::RefCell;
use std::rc::Rc;

use crate::reactor::Reactor;

/// Index of a shard in `[0, smp_count)`, immutable after construction.
pub type ShardId = usize;

thread_local! {
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// Publishes this thread's reactor. One reactor per thread.
pub(crate) fn set_reactor(r: Rc<Reactor>) {
    REACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(slot.is_none(), "a reactor is already running on this thread");
        *slot = Some(r);
    });
}

/// Tears down the thread-local binding when the reactor loop exits, so a
/// thread (a test, notably) can host another reactor later.
pub(crate) fn unset_reactor() {
    REACTOR.with(|cell| {
        cell.borrow_mut().take();
    });
}

pub fn reactor_running() -> bool {
    REACTOR.with(|cell| cell.borrow().is_some())
}

/// Runs `f` against the calling thread's reactor.
///
/// # Panics
///
/// Panics if called from a thread that is not a shard.
#[track_caller]
pub fn with_reactor<F, R>(f: F) -> R
where
    F: FnOnce(&Reactor) -> R,
{
    let r = REACTOR.with(|cell| {
        cell.borrow()
            .clone()
            .expect("not running on a shard thread")
    });
    f(&r)
}

/// Id of the shard the calling thread runs, panicking off-shard.
#[track_caller]
pub fn this_shard_id() -> ShardId {
    with_reactor(|r| r.id())
}
