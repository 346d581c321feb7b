use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ReactorConfig;
use crate::io::PendingIo;
use crate::reactor::backend::{Backend, PollableFdHandle, ShutdownHow, SleepNotifier};
use crate::reactor::Reactor;
use crate::smp::{BackendFactory, ShardCtl};

/// In-memory backend: staged submissions complete successfully with the
/// request's own length on the next reap. Blocking waits poll the wakeup
/// eventfd with a short timeout so a wedged test fails instead of
/// hanging.
pub(crate) struct MockBackend {
    notifier: Arc<SleepNotifier>,
    staged: RefCell<Vec<PendingIo>>,
    submitted: RefCell<VecDeque<PendingIo>>,
    armed_deadline: Cell<Option<Instant>>,
    ticks_started: Cell<u32>,
    ticks_stopped: Cell<u32>,
    handle_seq: Cell<u64>,
}

const MOCK_WAIT_TIMEOUT_MS: libc::c_int = 50;

impl MockBackend {
    pub(crate) fn new(notifier: Arc<SleepNotifier>) -> MockBackend {
        MockBackend {
            notifier,
            staged: RefCell::new(Vec::new()),
            submitted: RefCell::new(VecDeque::new()),
            armed_deadline: Cell::new(None),
            ticks_started: Cell::new(0),
            ticks_stopped: Cell::new(0),
            handle_seq: Cell::new(0),
        }
    }

    pub(crate) fn staged_len(&self) -> usize {
        self.staged.borrow().len()
    }

    pub(crate) fn submitted_len(&self) -> usize {
        self.submitted.borrow().len()
    }

    pub(crate) fn armed_deadline(&self) -> Option<Instant> {
        self.armed_deadline.get()
    }

    pub(crate) fn tick_balance(&self) -> i64 {
        self.ticks_started.get() as i64 - self.ticks_stopped.get() as i64
    }
}

impl Backend for MockBackend {
    fn make_pollable_fd_state(&self, _fd: RawFd, _speculation: bool) -> PollableFdHandle {
        let seq = self.handle_seq.get();
        self.handle_seq.set(seq + 1);
        PollableFdHandle(seq)
    }

    fn forget(&self, _h: PollableFdHandle) {}

    fn shutdown(&self, _h: &PollableFdHandle, _how: ShutdownHow) {}

    fn submit_io(&self, pending: PendingIo) {
        self.staged.borrow_mut().push(pending);
    }

    fn reap_kernel_completions(&self) -> bool {
        let mut any = false;
        loop {
            let next = self.submitted.borrow_mut().pop_front();
            let Some(p) = next else { break };
            let len = p.request.length();
            (p.completion)(Ok(len));
            any = true;
        }
        any
    }

    fn kernel_submit_work(&self) -> bool {
        let mut staged = self.staged.borrow_mut();
        if staged.is_empty() {
            return false;
        }
        self.submitted.borrow_mut().extend(staged.drain(..));
        true
    }

    fn wait_and_process_events(&self, _sigmask: Option<&libc::sigset_t>) {
        let mut pfd = libc::pollfd {
            fd: self.notifier.eventfd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe {
            libc::poll(&mut pfd, 1, MOCK_WAIT_TIMEOUT_MS);
        }
        self.notifier.consume();
    }

    fn start_tick(&self) {
        self.ticks_started.set(self.ticks_started.get() + 1);
    }

    fn stop_tick(&self) {
        self.ticks_stopped.set(self.ticks_stopped.get() + 1);
    }

    fn arm_highres_timer(&self, deadline: Instant) {
        self.armed_deadline.set(Some(deadline));
    }
}

/// A reactor bound to the current thread with a mock backend; unbinds on
/// drop so one test thread can host several fixtures in sequence.
pub(crate) struct TestReactor {
    pub(crate) reactor: Rc<Reactor>,
    pub(crate) backend: Rc<MockBackend>,
}

impl Drop for TestReactor {
    fn drop(&mut self) {
        self.reactor.detach();
    }
}

pub(crate) fn init_test_reactor() -> TestReactor {
    init_test_reactor_with(ReactorConfig::default())
}

pub(crate) fn init_test_reactor_with(cfg: ReactorConfig) -> TestReactor {
    let ctl = ShardCtl::new(0).expect("wakeup channel");
    let backend = Rc::new(MockBackend::new(ctl.notifier.clone()));
    let reactor = Reactor::new(0, cfg, backend.clone(), ctl);
    reactor.attach();
    TestReactor { reactor, backend }
}

pub(crate) fn mock_backend_factory() -> BackendFactory {
    Arc::new(|notifier| Rc::new(MockBackend::new(notifier)) as Rc<dyn Backend>)
}
