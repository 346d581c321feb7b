use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::future::Future;
use crate::io::PendingIo;

/// Opaque backend-owned state for one pollable file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollableFdHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// The kernel-facing interface injected at reactor construction.
///
/// Concrete implementations (epoll, io_uring, kqueue) live outside this
/// crate; the reactor only ever talks to this trait. Network data-path
/// methods have panicking defaults so a storage-only backend doesn't have
/// to stub them.
pub trait Backend {
    fn make_pollable_fd_state(&self, fd: RawFd, speculation: bool) -> PollableFdHandle;

    fn readable(&self, _h: &PollableFdHandle) -> Future<()> {
        unimplemented!("backend has no poll support")
    }

    fn writeable(&self, _h: &PollableFdHandle) -> Future<()> {
        unimplemented!("backend has no poll support")
    }

    fn readable_or_writeable(&self, _h: &PollableFdHandle) -> Future<()> {
        unimplemented!("backend has no poll support")
    }

    fn read_some(&self, _h: &PollableFdHandle, _buf: &mut [u8]) -> Future<usize> {
        unimplemented!("backend has no socket support")
    }

    fn write_some(&self, _h: &PollableFdHandle, _buf: &[u8]) -> Future<usize> {
        unimplemented!("backend has no socket support")
    }

    fn accept(&self, _h: &PollableFdHandle) -> Future<RawFd> {
        unimplemented!("backend has no socket support")
    }

    fn connect(&self, _h: &PollableFdHandle, _addr: std::net::SocketAddr) -> Future<()> {
        unimplemented!("backend has no socket support")
    }

    fn forget(&self, h: PollableFdHandle);

    fn shutdown(&self, h: &PollableFdHandle, how: ShutdownHow);

    /// Stages one admitted I/O request for the next `kernel_submit_work`.
    fn submit_io(&self, pending: PendingIo);

    /// Collects finished kernel operations, running their completions.
    /// Returns true if any completed.
    fn reap_kernel_completions(&self) -> bool;

    /// Pushes staged work into the kernel. Returns true if any was pushed.
    fn kernel_submit_work(&self) -> bool;

    /// False when the backend has in-flight work that would be lost by
    /// blocking (e.g. a busy poll ring).
    fn kernel_events_can_sleep(&self) -> bool {
        true
    }

    /// Blocks until an event arrives or the wakeup eventfd is written.
    fn wait_and_process_events(&self, sigmask: Option<&libc::sigset_t>);

    /// Quota-timer control: `start_tick` arms the periodic tick that sets
    /// the preemption monitor; `stop_tick` disables it across sleep.
    fn start_tick(&self);
    fn stop_tick(&self);

    /// Re-arms the single OS-level high-resolution timer to fire at
    /// `deadline`.
    fn arm_highres_timer(&self, deadline: Instant);

    fn start_handling_signal(&self) {}

    /// Hook for backends that route process signals through their own
    /// delivery mechanism (signalfd, io_uring).
    fn signal_received(&self, _sig: libc::c_int) {}
}

/// Wakeup channel for one shard: the `sleeping` flag producers check and
/// the eventfd they write to rouse a blocked reactor.
///
/// Protocol: the reactor stores `sleeping = true` (release) right before
/// blocking in the backend. A producer, after pushing work, issues a
/// compiler fence, checks the flag with a relaxed load, clears it and
/// writes one byte. The reactor clears the flag again on wake; the double
/// clear is benign and keeps the writer side wait-free.
pub struct SleepNotifier {
    eventfd: RawFd,
    sleeping: AtomicBool,
}

impl SleepNotifier {
    pub(crate) fn new() -> io::Result<Arc<SleepNotifier>> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Arc::new(SleepNotifier {
            eventfd: fd,
            sleeping: AtomicBool::new(false),
        }))
    }

    pub fn eventfd(&self) -> RawFd {
        self.eventfd
    }

    pub(crate) fn prepare_to_sleep(&self) {
        self.sleeping.store(true, Ordering::Release);
    }

    pub(crate) fn wake_up(&self) {
        self.sleeping.store(false, Ordering::Relaxed);
    }

    /// Producer side: called after pushing into a cross-shard ring.
    pub(crate) fn maybe_notify(&self) {
        // Pair with the release store in `prepare_to_sleep`; the fence
        // keeps the ring push ordered before the flag load without paying
        // for a seq_cst RMW on every submission.
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.sleeping.load(Ordering::Relaxed) {
            self.sleeping.store(false, Ordering::Relaxed);
            self.notify();
        }
    }

    /// Writes the wakeup byte. Async-signal-safe.
    pub(crate) fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.eventfd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Drains the eventfd counter after waking.
    pub(crate) fn consume(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(
                self.eventfd,
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    pub(crate) fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Relaxed)
    }
}

impl Drop for SleepNotifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_only_wakes_a_sleeping_reactor() {
        let n = SleepNotifier::new().unwrap();

        // Awake: nothing written.
        n.maybe_notify();
        assert!(!n.is_sleeping());

        n.prepare_to_sleep();
        assert!(n.is_sleeping());
        n.maybe_notify();
        // The writer cleared the flag, so a second producer skips the write.
        assert!(!n.is_sleeping());

        let mut buf: u64 = 0;
        let r = unsafe {
            libc::read(
                n.eventfd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(r, 8);
        assert_eq!(buf, 1, "exactly one wakeup byte");
    }

    #[test]
    fn consume_clears_the_counter() {
        let n = SleepNotifier::new().unwrap();
        n.notify();
        n.notify();
        n.consume();
        let mut buf: u64 = 0;
        let r = unsafe {
            libc::read(
                n.eventfd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // Non-blocking eventfd with nothing pending returns EAGAIN.
        assert_eq!(r, -1);
    }
}
