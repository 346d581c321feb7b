use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::sched::{current_scheduling_group, Task};
use crate::shard;

thread_local! {
    static ABANDONED_FAILED: Cell<u64> = const { Cell::new(0) };
    static ABANDONED_FAILED_LOGGED: Cell<bool> = const { Cell::new(false) };
}

/// Number of failed futures this shard dropped without observing the error.
pub fn abandoned_failed_futures() -> u64 {
    ABANDONED_FAILED.with(|c| c.get())
}

/// The continuation payload carried by a [`Task`]; runs the chained
/// closure with the predecessor's result already captured.
pub(crate) struct Continuation(Box<dyn FnOnce()>);

impl Continuation {
    pub(crate) fn run(self) {
        (self.0)()
    }
}

enum State<T> {
    NotReady,
    Ready(Result<T>),
    /// A continuation is installed and waiting for resolution.
    Chained(Box<dyn FnOnce(Result<T>)>),
    Consumed,
}

struct Shared<T> {
    state: RefCell<State<T>>,
}

impl<T: 'static> Shared<T> {
    fn resolve(self: &Rc<Self>, result: Result<T>) {
        let prev = self.state.replace(State::Consumed);
        match prev {
            State::NotReady => {
                *self.state.borrow_mut() = State::Ready(result);
            }
            State::Chained(f) => schedule_continuation(move || f(result)),
            State::Ready(_) | State::Consumed => {
                unreachable!("future resolved twice")
            }
        }
    }
}

/// Enqueues onto the local reactor in the caller's scheduling group;
/// degenerates to inline execution when no reactor is running (unit
/// tests of leaf modules).
fn schedule_continuation(f: impl FnOnce() + 'static) {
    if shard::reactor_running() {
        let group = current_scheduling_group();
        let task = Task::from_continuation(group, Continuation(Box::new(f)));
        shard::with_reactor(move |r| r.add_task(task));
    } else {
        f();
    }
}

/// The write half of an asynchronous value.
///
/// Dropping an unresolved promise resolves its future with
/// [`Error::Abandoned`] so the continuation still runs and can clean up.
pub struct Promise<T: 'static> {
    shared: Option<Rc<Shared<T>>>,
}

impl<T: 'static> Promise<T> {
    pub fn set_value(mut self, value: T) {
        self.shared.take().expect("promise resolved twice").resolve(Ok(value));
    }

    pub fn set_error(mut self, err: Error) {
        self.shared.take().expect("promise resolved twice").resolve(Err(err));
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Err(Error::Abandoned));
        }
    }
}

/// The read half: a value that is not-ready, ready, or failed.
///
/// Compositions with [`then`](Future::then) install a continuation that is
/// enqueued as a task on the creating shard's reactor when the value
/// resolves. Continuations must not block.
pub struct Future<T: 'static> {
    shared: Rc<Shared<T>>,
}

/// Creates a connected promise/future pair.
pub fn channel<T: 'static>() -> (Promise<T>, Future<T>) {
    let shared = Rc::new(Shared {
        state: RefCell::new(State::NotReady),
    });
    (
        Promise {
            shared: Some(shared.clone()),
        },
        Future { shared },
    )
}

impl<T: 'static> Future<T> {
    pub fn ready(value: T) -> Future<T> {
        Future {
            shared: Rc::new(Shared {
                state: RefCell::new(State::Ready(Ok(value))),
            }),
        }
    }

    pub fn failed(err: Error) -> Future<T> {
        Future {
            shared: Rc::new(Shared {
                state: RefCell::new(State::Ready(Err(err))),
            }),
        }
    }

    /// Chains `f` over a successful result; errors skip `f` and propagate.
    pub fn then<U: 'static>(self, f: impl FnOnce(T) -> Result<U> + 'static) -> Future<U> {
        self.then_wrapped(move |r| r.and_then(f))
    }

    /// Chains `f` over the raw result, letting it intercept errors.
    pub fn then_wrapped<U: 'static>(
        self,
        f: impl FnOnce(Result<T>) -> Result<U> + 'static,
    ) -> Future<U> {
        let (promise, future) = channel::<U>();
        self.install(move |result| match f(result) {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_error(e),
        });
        future
    }

    /// Terminal consumer; observes the result, failed or not.
    pub fn handle(self, f: impl FnOnce(Result<T>) + 'static) {
        self.install(f);
    }

    /// Takes the result if already resolved. Test and poller plumbing.
    pub fn try_take(&self) -> Option<Result<T>> {
        let mut state = self.shared.state.borrow_mut();
        match &*state {
            State::Ready(_) => match std::mem::replace(&mut *state, State::Consumed) {
                State::Ready(r) => Some(r),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    fn install(self, f: impl FnOnce(Result<T>) + 'static) {
        let mut state = self.shared.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::NotReady => {
                *state = State::Chained(Box::new(f));
            }
            State::Ready(result) => {
                drop(state);
                schedule_continuation(move || f(result));
            }
            State::Chained(_) => panic!("future already has a continuation"),
            State::Consumed => panic!("future already consumed"),
        }
    }
}

impl<T: 'static> Drop for Future<T> {
    fn drop(&mut self) {
        // An unobserved failure is counted and logged once per shard.
        let state = self.shared.state.borrow();
        if let State::Ready(Err(err)) = &*state {
            ABANDONED_FAILED.with(|c| c.set(c.get() + 1));
            if !ABANDONED_FAILED_LOGGED.with(|l| l.replace(true)) {
                log::warn!("dropping a failed future without observing it: {err}");
            }
        }
    }
}
