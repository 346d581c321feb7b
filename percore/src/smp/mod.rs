use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;

use crate::config::SmpConfig;
use crate::future::{channel, Future};
use crate::io::properties::{load_io_properties, DiskConfig};
use crate::io::queue::IoQueue;
use crate::reactor::backend::{Backend, SleepNotifier};
use crate::reactor::Reactor;
use crate::sched::Task;
use crate::shard::{self, ShardId};
use crate::syscall::SyscallPool;
use crate::utils::thread::{pin_this_thread, set_current_thread_name};

pub(crate) mod queue;
pub use queue::SmpQueueStats;
pub(crate) use queue::{ChannelCore, PeerReceiver, PeerSender};

/// Lifecycle of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardState {
    Booting = 0,
    InitializingIo = 1,
    Running = 2,
    DrainingTasks = 3,
    Stopped = 4,
}

impl ShardState {
    fn from_u8(v: u8) -> ShardState {
        match v {
            0 => ShardState::Booting,
            1 => ShardState::InitializingIo,
            2 => ShardState::Running,
            3 => ShardState::DrainingTasks,
            _ => ShardState::Stopped,
        }
    }
}

/// The cross-thread-visible sliver of one shard: its wakeup channel, the
/// stopped flag, and the lifecycle state. Everything else about a shard
/// is private to its thread.
pub(crate) struct ShardCtl {
    pub(crate) id: ShardId,
    pub(crate) notifier: Arc<SleepNotifier>,
    stopped: AtomicBool,
    state: AtomicU8,
    pub(crate) return_code: AtomicI32,
}

impl ShardCtl {
    pub(crate) fn new(id: ShardId) -> io::Result<Arc<ShardCtl>> {
        Ok(Arc::new(ShardCtl {
            id,
            notifier: SleepNotifier::new()?,
            stopped: AtomicBool::new(false),
            state: AtomicU8::new(ShardState::Booting as u8),
            return_code: AtomicI32::new(0),
        }))
    }

    pub(crate) fn state(&self) -> ShardState {
        ShardState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: ShardState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Back-pressure bucket for cross-shard submissions; each group holds a
/// per-destination semaphore on every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpServiceGroup(pub(crate) usize);

pub const DEFAULT_SMP_SERVICE_GROUP: SmpServiceGroup = SmpServiceGroup(0);

const DEFAULT_SSG_LIMIT: usize = 1 << 20;

static SSG_LIMITS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Creates a service group limited to `max_nonlocal_requests` in-flight
/// submissions per destination.
pub fn create_smp_service_group(max_nonlocal_requests: usize) -> SmpServiceGroup {
    let mut limits = SSG_LIMITS.lock();
    if limits.is_empty() {
        limits.push(DEFAULT_SSG_LIMIT);
    }
    limits.push(max_nonlocal_requests.max(1));
    SmpServiceGroup(limits.len() - 1)
}

pub(crate) fn service_group_limit(ssg: SmpServiceGroup) -> usize {
    let limits = SSG_LIMITS.lock();
    limits.get(ssg.0).copied().unwrap_or(DEFAULT_SSG_LIMIT)
}

/// Runs `func` on shard `to`, resolving on the calling shard with the
/// result. FIFO with respect to other submissions to the same shard.
pub fn submit_to<T, F>(to: ShardId, func: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    submit_to_in(DEFAULT_SMP_SERVICE_GROUP, to, None, func)
}

/// Same, with an explicit service group and submission deadline. A wait
/// past the deadline fails the future locally; nothing is enqueued.
pub fn submit_to_in<T, F>(
    ssg: SmpServiceGroup,
    to: ShardId,
    deadline: Option<Instant>,
    func: F,
) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    shard::with_reactor(|r| {
        if to == r.id() {
            let (promise, future) = channel();
            r.add_task(Task::new(move || promise.set_value(func())));
            future
        } else {
            r.sender(to).submit(ssg, deadline, func)
        }
    })
}

/// Runs `func` on every shard, including the caller's.
pub fn invoke_on_all<F>(func: F) -> Future<()>
where
    F: Fn() + Clone + Send + 'static,
{
    let shards = shard::with_reactor(|r| r.shard_count());
    when_all(
        (0..shards)
            .map(|i| submit_to(i, func.clone()))
            .collect(),
    )
}

pub fn invoke_on_others<F>(func: F) -> Future<()>
where
    F: Fn() + Clone + Send + 'static,
{
    let (me, shards) = shard::with_reactor(|r| (r.id(), r.shard_count()));
    when_all(
        (0..shards)
            .filter(|i| *i != me)
            .map(|i| submit_to(i, func.clone()))
            .collect(),
    )
}

/// Resolves once every future resolved; fails with the first error.
pub fn when_all(futures: Vec<Future<()>>) -> Future<()> {
    if futures.is_empty() {
        return Future::ready(());
    }
    let (promise, result) = channel();
    let remaining = Rc::new(Cell::new(futures.len()));
    let promise = Rc::new(RefCell::new(Some(promise)));
    for f in futures {
        let remaining = remaining.clone();
        let promise = promise.clone();
        f.handle(move |r| {
            match r {
                Err(e) => {
                    if let Some(p) = promise.borrow_mut().take() {
                        p.set_error(e);
                    }
                }
                Ok(()) => {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        if let Some(p) = promise.borrow_mut().take() {
                            p.set_value(());
                        }
                    }
                }
            }
        });
    }
    result
}

// SIGINT/SIGTERM are translated into a stop() on shard 0 by the signal
// poller; the handler itself only sets a flag and pokes the wakeup fd.
static CAUGHT_SIGINT: AtomicBool = AtomicBool::new(false);
static CAUGHT_SIGTERM: AtomicBool = AtomicBool::new(false);
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn termination_signal_handler(sig: libc::c_int) {
    match sig {
        libc::SIGINT => CAUGHT_SIGINT.store(true, Ordering::Relaxed),
        libc::SIGTERM => CAUGHT_SIGTERM.store(true, Ordering::Relaxed),
        _ => return,
    }
    let fd = SIGNAL_WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

pub(crate) fn install_termination_handlers(wake_fd: RawFd) {
    SIGNAL_WAKE_FD.store(wake_fd, Ordering::Relaxed);
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = termination_signal_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

pub(crate) fn take_caught_termination_signal() -> Option<libc::c_int> {
    if CAUGHT_SIGINT.swap(false, Ordering::Relaxed) {
        Some(libc::SIGINT)
    } else if CAUGHT_SIGTERM.swap(false, Ordering::Relaxed) {
        Some(libc::SIGTERM)
    } else {
        None
    }
}

/// Builds the backend for one shard; the notifier is the shard's wakeup
/// channel, which the backend must watch while blocked.
pub type BackendFactory = Arc<dyn Fn(Arc<SleepNotifier>) -> Rc<dyn Backend> + Send + Sync>;

struct BootShared {
    cfg: SmpConfig,
    disks: DiskConfig,
    ctls: Mutex<Vec<Option<Arc<ShardCtl>>>>,
    grid: Mutex<Option<Vec<Vec<Option<Arc<ChannelCore>>>>>>,
    reactors_registered: Barrier,
    smp_queues_constructed: Barrier,
    inited: Barrier,
    all_event_loops_done: Arc<Barrier>,
}

/// Boots one reactor per pinned OS thread, wires the cross-shard queue
/// grid between every ordered pair, runs the fleet to completion and
/// returns the exit code set by [`Reactor::exit`].
pub struct ShardManager {
    cfg: SmpConfig,
    backend_factory: BackendFactory,
}

impl ShardManager {
    pub fn new(cfg: SmpConfig, backend_factory: BackendFactory) -> ShardManager {
        ShardManager {
            cfg,
            backend_factory,
        }
    }

    /// Start sequence, barrier-synchronized:
    /// 1. spawn one pinned thread per shard, each allocating its reactor;
    /// 2. shard 0 builds the N×N queue grid;
    /// 3. every shard wires its queue endpoints and I/O queues;
    /// 4. every shard enters its reactor loop, shard 0 with `main` queued.
    pub fn run<F>(self, main: F) -> Result<i32>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.cfg.shards;
        let disks = load_io_properties(&self.cfg).context("loading I/O properties")?;
        let shared = Arc::new(BootShared {
            cfg: self.cfg.clone(),
            disks,
            ctls: Mutex::new(vec![None; n]),
            grid: Mutex::new(None),
            reactors_registered: Barrier::new(n),
            smp_queues_constructed: Barrier::new(n),
            inited: Barrier::new(n),
            all_event_loops_done: Arc::new(Barrier::new(n)),
        });

        let mut handles = Vec::with_capacity(n.saturating_sub(1));
        for i in 1..n {
            let shared = shared.clone();
            let factory = self.backend_factory.clone();
            let handle = thread::Builder::new()
                .name(format!("percore-{i}"))
                .spawn(move || shard_main(i, shared, factory, None))
                .context("spawning shard thread")?;
            handles.push(handle);
        }

        let code = shard_main(0, shared, self.backend_factory.clone(), Some(Box::new(main)))?;

        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("shard thread panicked"))??;
        }
        Ok(code)
    }
}

fn shard_main(
    id: ShardId,
    shared: Arc<BootShared>,
    backend_factory: BackendFactory,
    main: Option<Box<dyn FnOnce() + Send>>,
) -> Result<i32> {
    let cfg = &shared.cfg;
    if cfg.thread_affinity {
        if let Err(e) = pin_this_thread(cfg.cpu_for_shard(id)) {
            log::warn!("shard {id}: could not pin thread: {e}");
        }
    }
    set_current_thread_name(&format!("percore-{id}"));

    let ctl = ShardCtl::new(id).context("creating shard wakeup channel")?;
    shared.ctls.lock()[id] = Some(ctl.clone());

    let backend = (backend_factory)(ctl.notifier.clone());
    let reactor = Reactor::new(id, cfg.reactor.clone(), backend, ctl.clone());
    reactor.attach();

    shared.reactors_registered.wait();
    ctl.set_state(ShardState::InitializingIo);

    // Shard 0 alone builds the grid; everyone consumes it after the barrier.
    if id == 0 {
        let n = cfg.shards;
        let mut grid: Vec<Vec<Option<Arc<ChannelCore>>>> = (0..n)
            .map(|_| (0..n).map(|_| None).collect())
            .collect();
        for (from, row) in grid.iter_mut().enumerate() {
            for (to, slot) in row.iter_mut().enumerate() {
                if from != to {
                    *slot = Some(ChannelCore::new());
                }
            }
        }
        *shared.grid.lock() = Some(grid);
    }
    shared.smp_queues_constructed.wait();

    // start_all_queues: wire this shard's endpoints out of the grid.
    {
        let ctls: Vec<Arc<ShardCtl>> = shared
            .ctls
            .lock()
            .iter()
            .map(|c| c.clone().expect("all shards registered"))
            .collect();
        let grid_guard = shared.grid.lock();
        let grid = grid_guard.as_ref().expect("grid built by shard 0");

        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for other in 0..cfg.shards {
            if other == id {
                continue;
            }
            let out = grid[id][other].as_ref().unwrap().clone();
            senders.push(PeerSender::new(other, out, ctls[other].clone()));
            let inbound = grid[other][id].as_ref().unwrap().clone();
            receivers.push(PeerReceiver::new(other, inbound, ctls[other].clone()));
        }
        reactor.install_smp(senders, receivers, ctls, shared.all_event_loops_done.clone());
    }

    // Attach per-device I/O queues, budget split across I/O groups.
    for (dev, params) in &shared.disks.mountpoints {
        let queue_cfg = params.to_queue_config().per_group(cfg.num_io_groups);
        reactor.add_io_queue(*dev, Rc::new(IoQueue::new(queue_cfg)));
    }

    reactor.install_syscall_pool(SyscallPool::new(1, ctl.notifier.clone())?);

    if id == 0 && cfg.reactor.auto_handle_sigint_sigterm {
        install_termination_handlers(ctl.notifier.eventfd());
    }

    shared.inited.wait();
    ctl.set_state(ShardState::Running);
    log::debug!("shard {} running on cpu {}", ctl.id, cfg.cpu_for_shard(id));

    if let Some(main) = main {
        reactor.add_task(Task::new(main));
    }

    let code = reactor.run();
    reactor.detach();
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_state_round_trips() {
        for s in [
            ShardState::Booting,
            ShardState::InitializingIo,
            ShardState::Running,
            ShardState::DrainingTasks,
            ShardState::Stopped,
        ] {
            assert_eq!(ShardState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn shard_ctl_stop_flag() {
        let ctl = ShardCtl::new(2).unwrap();
        assert!(!ctl.is_stopped());
        ctl.set_stopped();
        assert!(ctl.is_stopped());
        assert_eq!(ctl.state(), ShardState::Booting);
        ctl.set_state(ShardState::Running);
        assert_eq!(ctl.state(), ShardState::Running);
    }

    #[test]
    fn service_groups_have_limits() {
        let g = create_smp_service_group(7);
        assert_eq!(service_group_limit(g), 7);
        assert_eq!(
            service_group_limit(DEFAULT_SMP_SERVICE_GROUP),
            DEFAULT_SSG_LIMIT
        );
        // Zero is clamped; a group that can never submit is useless.
        let z = create_smp_service_group(0);
        assert_eq!(service_group_limit(z), 1);
    }

    #[test]
    fn when_all_resolves_after_every_future() {
        let (p1, f1) = channel();
        let (p2, f2) = channel();
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        when_all(vec![f1, f2]).handle(move |r| {
            r.unwrap();
            done2.set(true);
        });
        p1.set_value(());
        assert!(!done.get());
        p2.set_value(());
        assert!(done.get());
    }

    #[test]
    fn when_all_fails_fast() {
        let (p1, f1) = channel();
        let (_p2, f2) = channel::<()>();
        let outcome = Rc::new(Cell::new(None));
        let outcome2 = outcome.clone();
        when_all(vec![f1, f2]).handle(move |r| outcome2.set(Some(r.is_ok())));
        p1.set_error(crate::error::Error::DeadlineExceeded);
        assert_eq!(outcome.get(), Some(false));
    }

    #[test]
    fn when_all_of_nothing_is_ready() {
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        when_all(Vec::new()).handle(move |r| {
            r.unwrap();
            done2.set(true);
        });
        assert!(done.get());
    }

    fn fleet_config(shards: usize) -> SmpConfig {
        let mut cfg = SmpConfig::default();
        cfg.shards = shards;
        // Tests must not pin CPUs or hijack the process signal handlers.
        cfg.thread_affinity = false;
        cfg.reactor.auto_handle_sigint_sigterm = false;
        cfg
    }

    #[test]
    fn fleet_cross_shard_fifo_and_clean_exit() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let recorded2 = recorded.clone();

        let manager = ShardManager::new(fleet_config(2), crate::test_utils::mock_backend_factory());
        let code = manager
            .run(move || {
                let futures: Vec<Future<()>> = (0..500u32)
                    .map(|i| {
                        let recorded = recorded2.clone();
                        submit_to(1, move || {
                            recorded.lock().push(i);
                        })
                    })
                    .collect();
                when_all(futures).handle(|r| {
                    r.unwrap();
                    shard::with_reactor(|r| r.exit(0));
                });
            })
            .unwrap();

        assert_eq!(code, 0);
        let recorded = recorded.lock();
        // Destination observes one producer's submissions in order.
        assert_eq!(*recorded, (0..500).collect::<Vec<u32>>());
    }

    #[test]
    fn fleet_round_trip_preserves_payload() {
        const PAYLOAD: u64 = 0x1234_5678_9abc_def0;

        let manager = ShardManager::new(fleet_config(2), crate::test_utils::mock_backend_factory());
        let code = manager
            .run(|| {
                submit_to(1, || PAYLOAD).handle(|r| {
                    let ok = matches!(r, Ok(PAYLOAD));
                    shard::with_reactor(|r| r.exit(if ok { 0 } else { 1 }));
                });
            })
            .unwrap();
        assert_eq!(code, 0, "payload corrupted crossing shards");
    }

    #[test]
    fn fleet_at_exit_runs_once_per_shard_in_reverse_order() {
        let events: Arc<Mutex<Vec<(ShardId, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();

        let manager = ShardManager::new(fleet_config(2), crate::test_utils::mock_backend_factory());
        let code = manager
            .run(move || {
                for tag in [1u32, 2] {
                    let events = events2.clone();
                    shard::with_reactor(|r| {
                        r.at_exit(move || events.lock().push((0, tag)));
                    });
                }
                let events_remote = events2.clone();
                submit_to(1, move || {
                    for tag in [1u32, 2] {
                        let events = events_remote.clone();
                        shard::with_reactor(|r| {
                            r.at_exit(move || events.lock().push((1, tag)));
                        });
                    }
                })
                .handle(|r| {
                    r.unwrap();
                    shard::with_reactor(|r| r.exit(0));
                });
            })
            .unwrap();

        assert_eq!(code, 0);
        let events = events.lock();
        assert_eq!(events.len(), 4, "each hook exactly once: {events:?}");
        for shard_id in [0, 1] {
            let tags: Vec<u32> = events
                .iter()
                .filter(|(s, _)| *s == shard_id)
                .map(|(_, t)| *t)
                .collect();
            assert_eq!(tags, vec![2, 1], "shard {shard_id} not reverse order");
        }
    }
}
