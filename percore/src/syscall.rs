//! Thread pool for blocking syscalls (open, stat, rename and friends).
//! Nothing here ever runs on the reactor thread: the reactor enqueues a
//! work item into a bounded ring and a pool thread executes it, pushing
//! the result into a completion ring the syscall poller drains.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;

use crate::error::Error;
use crate::future::{channel, Future, Promise};
use crate::reactor::backend::SleepNotifier;
use crate::smp::queue::panic_message;
use crate::sync::Semaphore;

/// Ring capacity; also the back-pressure semaphore size, so the rings can
/// never overflow.
pub(crate) const SYSCALL_QUEUE_LENGTH: usize = 128;

trait SyscallWork: Send {
    /// Runs on a pool thread.
    fn run(self: Box<Self>) -> Box<dyn SyscallWork>;
    /// Runs on the reactor thread, resolving the waiting future.
    fn complete(self: Box<Self>);
}

struct SyscallItem<F, T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    func: Option<F>,
    result: Option<thread::Result<io::Result<T>>>,
    /// Only touched by `complete`, which runs on the submitting shard.
    promise: Option<Promise<T>>,
}

// Safety: the promise half is non-Send but is only dereferenced in
// `complete()`, back on the shard that created it; pool threads touch
// `func` and `result` exclusively.
unsafe impl<F, T> Send for SyscallItem<F, T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
}

impl<F, T> SyscallWork for SyscallItem<F, T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    fn run(mut self: Box<Self>) -> Box<dyn SyscallWork> {
        let func = self.func.take().expect("syscall item run twice");
        self.result = Some(catch_unwind(AssertUnwindSafe(func)));
        self
    }

    fn complete(mut self: Box<Self>) {
        let promise = self.promise.take().expect("syscall item completed twice");
        match self.result.take() {
            Some(Ok(Ok(value))) => promise.set_value(value),
            Some(Ok(Err(io_err))) => promise.set_error(Error::System(io_err)),
            Some(Err(panic)) => promise.set_error(Error::RemotePanic(panic_message(&panic))),
            None => promise.set_error(Error::AllRequestsFailed),
        }
    }
}

/// Fixed pool of OS threads executing blocking syscalls on behalf of one
/// shard.
pub(crate) struct SyscallPool {
    pending: Arc<ArrayQueue<Box<dyn SyscallWork>>>,
    completed: Arc<ArrayQueue<Box<dyn SyscallWork>>>,
    queue_has_room: Semaphore,
    kick_fd: libc::c_int,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl SyscallPool {
    pub(crate) fn new(threads: usize, notifier: Arc<SleepNotifier>) -> io::Result<SyscallPool> {
        // Blocking eventfd: pool threads park in read(2) until kicked.
        let kick_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if kick_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let pending: Arc<ArrayQueue<Box<dyn SyscallWork>>> =
            Arc::new(ArrayQueue::new(SYSCALL_QUEUE_LENGTH));
        let completed: Arc<ArrayQueue<Box<dyn SyscallWork>>> =
            Arc::new(ArrayQueue::new(SYSCALL_QUEUE_LENGTH));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..threads.max(1))
            .map(|i| {
                let pending = pending.clone();
                let completed = completed.clone();
                let shutdown = shutdown.clone();
                let notifier = notifier.clone();
                thread::Builder::new()
                    .name(format!("percore-syscall-{i}"))
                    .spawn(move || {
                        worker_loop(kick_fd, pending, completed, shutdown, notifier)
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(SyscallPool {
            pending,
            completed,
            queue_has_room: Semaphore::new(SYSCALL_QUEUE_LENGTH),
            kick_fd,
            shutdown,
            workers,
        })
    }

    /// Submits a blocking operation; the future resolves on this shard
    /// with the operation's result. Panics in `func` are captured and
    /// re-raised as an error on the future.
    pub(crate) fn submit<T, F>(&self, func: F) -> Future<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (promise, future) = channel();
        let item: Box<dyn SyscallWork> = Box::new(SyscallItem {
            func: Some(func),
            result: None,
            promise: Some(promise),
        });

        let pending = self.pending.clone();
        let kick_fd = self.kick_fd;
        self.queue_has_room
            .wait(1)
            .then_wrapped(move |r| {
                r.expect("untimed semaphore wait cannot fail");
                // The semaphore holds a unit per in-flight item, so the
                // ring has room by construction.
                if pending.push(item).is_err() {
                    unreachable!("syscall ring overflow despite semaphore");
                }
                kick(kick_fd);
                Ok(())
            })
            .handle(|r| {
                let _ = r;
            });
        future
    }

    /// Drains completions on the reactor thread; returns how many.
    pub(crate) fn complete(&self) -> usize {
        let mut n = 0;
        while let Some(item) = self.completed.pop() {
            item.complete();
            n += 1;
        }
        if n > 0 {
            self.queue_has_room.signal(n);
        }
        n
    }

    pub(crate) fn has_completions(&self) -> bool {
        !self.completed.is_empty()
    }
}

fn kick(fd: libc::c_int) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
}

fn worker_loop(
    kick_fd: libc::c_int,
    pending: Arc<ArrayQueue<Box<dyn SyscallWork>>>,
    completed: Arc<ArrayQueue<Box<dyn SyscallWork>>>,
    shutdown: Arc<AtomicBool>,
    notifier: Arc<SleepNotifier>,
) {
    loop {
        let mut buf: u64 = 0;
        let r = unsafe { libc::read(kick_fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if shutdown.load(Ordering::Acquire) {
            // Re-kick so sibling workers see the shutdown too.
            kick(kick_fd);
            return;
        }
        while let Some(item) = pending.pop() {
            let mut done = item.run();
            // The semaphore bounds in-flight items to the ring size, so
            // this only spins if the reactor races us mid-drain.
            loop {
                match completed.push(done) {
                    Ok(()) => break,
                    Err(back) => {
                        done = back;
                        thread::yield_now();
                    }
                }
            }
            notifier.maybe_notify();
        }
    }
}

impl Drop for SyscallPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        kick(self.kick_fd);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        unsafe {
            libc::close(self.kick_fd);
        }
    }
}
