use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::config::ReactorConfig;
use crate::error::{FatalError, Result};
use crate::future::Future;
use crate::io::priority::IoPriorityClass;
use crate::io::queue::{IoIntent, IoQueue, IoQueueConfig};
use crate::io::IoRequest;
use crate::sched::queue::{ActiveEntry, TaskQueue};
use crate::sched::{self, SchedulingGroup, Task, MAX_SCHEDULING_GROUPS};
use crate::shard::{self, ShardId};
use crate::smp::{self, PeerReceiver, PeerSender, ShardCtl, ShardState};
use crate::syscall::SyscallPool;
use crate::timer::{ClockSource, Timer, TimerInner, TimerSet};

pub mod backend;
pub mod poller;
pub mod preempt;
pub(crate) mod stall;

pub use backend::{Backend, PollableFdHandle, ShutdownHow, SleepNotifier};
pub use poller::PollFn;
pub use preempt::{need_preempt, PreemptionMonitor};

use poller::PollerRegistry;
use stall::{CpuStallDetector, StallDetectorConfig};

/// What the installed idle-CPU handler did with its time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCpuHandlerResult {
    NoMoreWork,
    InterruptedByHigherPriorityTask,
}

type IdleCpuHandler = Box<dyn FnMut(&mut dyn FnMut() -> bool) -> IdleCpuHandlerResult>;

const LOAD_WINDOW: usize = 5;

/// The per-shard cooperative scheduler: time-slices tasks across weighted
/// queues, drives I/O completion, expires timers, forwards cross-shard
/// messages and watches for its own stalls.
///
/// One reactor exists per pinned OS thread; all methods are shard-local.
pub struct Reactor {
    id: ShardId,
    cfg: ReactorConfig,
    ctl: Arc<ShardCtl>,
    backend: Rc<dyn Backend>,
    preempt: Arc<PreemptionMonitor>,

    // Weighted-fair scheduler state.
    queues: RefCell<Vec<Option<Box<TaskQueue>>>>,
    active: RefCell<BinaryHeap<ActiveEntry>>,
    activating: RefCell<SmallVec<[SchedulingGroup; 8]>>,
    active_seq: Cell<u64>,
    last_vruntime: Cell<u64>,

    // Accounting.
    tasks_processed: Arc<AtomicU64>,
    polls: Cell<u64>,
    total_idle: Cell<Duration>,
    total_sleep: Cell<Duration>,
    last_idle: Cell<Duration>,
    loads: RefCell<VecDeque<f64>>,
    load: Cell<f64>,

    stall: RefCell<Option<CpuStallDetector>>,
    pollers: RefCell<PollerRegistry>,

    // One timer set per clock source.
    steady_timers: RefCell<TimerSet>,
    lowres_timers: RefCell<TimerSet>,
    manual_timers: RefCell<TimerSet>,
    lowres_now: Cell<Instant>,
    manual_now: Cell<Instant>,
    lowres_next_timeout: Cell<Option<Instant>>,

    exit_funcs: RefCell<Vec<Box<dyn FnOnce()>>>,
    idle_cpu_handler: RefCell<Option<IdleCpuHandler>>,

    // Cross-shard wiring, installed by the shard manager.
    senders: RefCell<Vec<Rc<PeerSender>>>,
    receivers: RefCell<Vec<Rc<PeerReceiver>>>,
    all_ctls: RefCell<Vec<Arc<ShardCtl>>>,
    shutdown_barrier: RefCell<Option<Arc<Barrier>>>,

    io_queues: RefCell<Vec<(u64, Rc<IoQueue>)>>,
    syscall_pool: RefCell<Option<SyscallPool>>,

    stopping: Cell<bool>,
}

impl Reactor {
    pub fn new(
        id: ShardId,
        cfg: ReactorConfig,
        backend: Rc<dyn Backend>,
        ctl: Arc<ShardCtl>,
    ) -> Rc<Reactor> {
        let now = Instant::now();
        let mut queues: Vec<Option<Box<TaskQueue>>> =
            (0..MAX_SCHEDULING_GROUPS).map(|_| None).collect();
        queues[SchedulingGroup::MAIN.index()] = Some(Box::new(TaskQueue::new(
            SchedulingGroup::MAIN,
            "main",
            1000.0,
        )));
        queues[SchedulingGroup::AT_EXIT.index()] = Some(Box::new(TaskQueue::new(
            SchedulingGroup::AT_EXIT,
            "atexit",
            1000.0,
        )));

        Rc::new(Reactor {
            id,
            cfg,
            ctl,
            backend,
            preempt: PreemptionMonitor::new(),
            queues: RefCell::new(queues),
            active: RefCell::new(BinaryHeap::new()),
            activating: RefCell::new(SmallVec::new()),
            active_seq: Cell::new(0),
            last_vruntime: Cell::new(0),
            tasks_processed: Arc::new(AtomicU64::new(0)),
            polls: Cell::new(0),
            total_idle: Cell::new(Duration::ZERO),
            total_sleep: Cell::new(Duration::ZERO),
            last_idle: Cell::new(Duration::ZERO),
            loads: RefCell::new(VecDeque::new()),
            load: Cell::new(0.0),
            stall: RefCell::new(None),
            pollers: RefCell::new(PollerRegistry::new()),
            steady_timers: RefCell::new(TimerSet::new()),
            lowres_timers: RefCell::new(TimerSet::new()),
            manual_timers: RefCell::new(TimerSet::new()),
            lowres_now: Cell::new(now),
            manual_now: Cell::new(now),
            lowres_next_timeout: Cell::new(None),
            exit_funcs: RefCell::new(Vec::new()),
            idle_cpu_handler: RefCell::new(None),
            senders: RefCell::new(Vec::new()),
            receivers: RefCell::new(Vec::new()),
            all_ctls: RefCell::new(Vec::new()),
            shutdown_barrier: RefCell::new(None),
            io_queues: RefCell::new(vec![(0, Rc::new(IoQueue::new(IoQueueConfig::default())))]),
            syscall_pool: RefCell::new(None),
            stopping: Cell::new(false),
        })
    }

    /// Binds this reactor to the calling thread: thread-local publication,
    /// preemption-monitor pointer, stall-detector CPU timer and the
    /// built-in pollers in their fixed order.
    pub fn attach(self: &Rc<Self>) {
        shard::set_reactor(self.clone());
        preempt::publish_monitor(&self.preempt);
        *self.stall.borrow_mut() = Some(CpuStallDetector::new(
            StallDetectorConfig {
                threshold: self.cfg.blocked_reactor_notify,
                reports_per_minute: self.cfg.blocked_reactor_reports_per_minute,
                shard: self.id,
            },
            self.tasks_processed.clone(),
        ));
        self.register_builtin_pollers();
    }

    pub fn detach(&self) {
        self.stall.borrow_mut().take();
        preempt::unpublish_monitor();
        shard::unset_reactor();
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.cfg
    }

    pub(crate) fn shard_count(&self) -> usize {
        let n = self.all_ctls.borrow().len();
        if n == 0 {
            1
        } else {
            n
        }
    }

    pub(crate) fn sender(&self, to: ShardId) -> Rc<PeerSender> {
        self.senders
            .borrow()
            .iter()
            .find(|s| s.to == to)
            .cloned()
            .unwrap_or_else(|| panic!("no cross-shard queue to shard {to}"))
    }

    pub(crate) fn install_smp(
        &self,
        senders: Vec<Rc<PeerSender>>,
        receivers: Vec<Rc<PeerReceiver>>,
        ctls: Vec<Arc<ShardCtl>>,
        shutdown_barrier: Arc<Barrier>,
    ) {
        *self.senders.borrow_mut() = senders;
        *self.receivers.borrow_mut() = receivers;
        *self.all_ctls.borrow_mut() = ctls;
        *self.shutdown_barrier.borrow_mut() = Some(shutdown_barrier);
    }

    pub(crate) fn install_syscall_pool(&self, pool: SyscallPool) {
        *self.syscall_pool.borrow_mut() = Some(pool);
    }

    pub(crate) fn add_io_queue(&self, dev: u64, queue: Rc<IoQueue>) {
        self.io_queues.borrow_mut().push((dev, queue));
    }

    // ---- task scheduling ----------------------------------------------

    /// Enqueues onto the task queue matching the task's scheduling group.
    pub fn add_task(&self, task: Task) {
        self.enqueue_task(task, false);
    }

    /// Enqueues at the front of the task's queue.
    pub fn add_urgent_task(&self, task: Task) {
        self.enqueue_task(task, true);
    }

    /// Urgent enqueue plus a preemption request, so the running batch
    /// yields at its next cooperation point.
    pub fn add_high_priority_task(&self, task: Task) {
        self.add_urgent_task(task);
        self.request_preemption();
    }

    fn enqueue_task(&self, task: Task, urgent: bool) {
        let group = task.scheduling_group();
        let mut queues = self.queues.borrow_mut();
        let tq = queues[group.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("scheduling group {} does not exist", group.index()));
        let was_empty = tq.q.is_empty();
        if urgent {
            tq.q.push_front(task);
        } else {
            tq.q.push_back(task);
        }
        if was_empty {
            self.activate(tq);
        }
    }

    /// A queue waking from idle gets its vruntime bumped to the global
    /// floor so it cannot dominate the CPU with its stale low vruntime.
    fn activate(&self, tq: &mut TaskQueue) {
        if tq.active {
            return;
        }
        tq.vruntime = tq.vruntime.max(self.last_vruntime.get());
        let now = Instant::now();
        tq.waittime += now - tq.ts;
        tq.ts = now;
        tq.active = true;
        self.activating.borrow_mut().push(tq.id);
    }

    fn insert_activating_task_queues(&self) {
        let groups: SmallVec<[SchedulingGroup; 8]> =
            std::mem::take(&mut *self.activating.borrow_mut());
        if groups.is_empty() {
            return;
        }
        let queues = self.queues.borrow();
        let mut active = self.active.borrow_mut();
        for group in groups {
            let tq = queues[group.index()].as_ref().unwrap();
            let seq = self.active_seq.get();
            self.active_seq.set(seq + 1);
            active.push(ActiveEntry {
                vruntime: tq.vruntime,
                seq,
                group,
            });
        }
    }

    pub(crate) fn have_more_tasks(&self) -> bool {
        !self.active.borrow().is_empty() || !self.activating.borrow().is_empty()
    }

    /// Runs one queue's tasks until it empties, preemption fires with the
    /// backlog under `max_task_backlog`, or the monitor is reset to let a
    /// deeply-backlogged queue make real progress.
    fn run_tasks(&self, group: SchedulingGroup) {
        sched::set_current_scheduling_group(group);
        loop {
            let task = {
                let mut queues = self.queues.borrow_mut();
                queues[group.index()].as_mut().unwrap().q.pop_front()
            };
            let Some(task) = task else { break };
            task.run_and_dispose();
            {
                let mut queues = self.queues.borrow_mut();
                queues[group.index()].as_mut().unwrap().tasks_processed += 1;
            }
            self.tasks_processed.fetch_add(1, Ordering::Relaxed);

            // Checked after the task so at least one always runs.
            if self.preempt.need_preempt() {
                let backlog = self.queues.borrow()[group.index()].as_ref().unwrap().q.len();
                if backlog <= self.cfg.max_task_backlog {
                    break;
                }
                // Under heavy backlog, aborting the batch too eagerly
                // wastes useful CPU; give it another quota.
                self.preempt.reset();
            }
        }
    }

    /// One scheduling round: repeatedly run the active queue with the
    /// smallest vruntime until preemption or no work remains.
    pub(crate) fn run_some_tasks(&self) {
        if !self.have_more_tasks() {
            return;
        }
        self.preempt.reset();
        let mut t_run_completed = Instant::now();
        if let Some(stall) = &*self.stall.borrow() {
            stall.start_task_run(t_run_completed);
        }
        loop {
            let t_run_started = t_run_completed;
            self.insert_activating_task_queues();
            let entry = self.active.borrow_mut().pop();
            let Some(entry) = entry else { break };
            let group = entry.group;
            {
                let mut queues = self.queues.borrow_mut();
                let tq = queues[group.index()].as_mut().unwrap();
                tq.current = true;
                tq.starvetime += t_run_started - tq.ts;
                self.last_vruntime
                    .set(self.last_vruntime.get().max(tq.vruntime));
            }
            self.run_tasks(group);
            t_run_completed = Instant::now();
            {
                let mut queues = self.queues.borrow_mut();
                let tq = queues[group.index()].as_mut().unwrap();
                tq.current = false;
                tq.account_runtime(t_run_completed - t_run_started, self.cfg.task_quota);
                tq.ts = t_run_completed;
                if tq.q.is_empty() {
                    tq.active = false;
                } else {
                    let seq = self.active_seq.get();
                    self.active_seq.set(seq + 1);
                    self.active.borrow_mut().push(ActiveEntry {
                        vruntime: tq.vruntime,
                        seq,
                        group,
                    });
                }
            }
            if !self.have_more_tasks() || self.preempt.need_preempt() {
                break;
            }
        }
        if let Some(stall) = &*self.stall.borrow() {
            stall.end_task_run(t_run_completed);
        }
        // Prevent inheritance from the last group run.
        sched::set_current_scheduling_group(SchedulingGroup::MAIN);
    }

    /// Creates a new weighted task queue; at most one per group id.
    pub fn create_scheduling_group(
        &self,
        name: impl Into<String>,
        shares: f32,
    ) -> Result<SchedulingGroup> {
        let mut queues = self.queues.borrow_mut();
        let slot = queues
            .iter()
            .position(|q| q.is_none())
            .ok_or_else(|| FatalError::Boot("out of scheduling groups".into()))?;
        let group = SchedulingGroup(slot as u16);
        queues[slot] = Some(Box::new(TaskQueue::new(group, name, shares)));
        Ok(group)
    }

    pub fn set_shares(&self, group: SchedulingGroup, shares: f32) {
        if let Some(tq) = self.queues.borrow_mut()[group.index()].as_mut() {
            tq.set_shares(shares);
        }
    }

    pub fn queue_stats(&self, group: SchedulingGroup) -> Option<TaskQueueStats> {
        self.queues.borrow()[group.index()]
            .as_ref()
            .map(|tq| TaskQueueStats {
                shares: tq.shares(),
                vruntime: tq.vruntime,
                runtime: tq.runtime,
                waittime: tq.waittime,
                starvetime: tq.starvetime,
                tasks_processed: tq.tasks_processed,
                time_spent_on_task_quota_violations: tq.time_spent_on_task_quota_violations,
                backlog: tq.q.len(),
            })
    }

    // ---- preemption ----------------------------------------------------

    #[inline(always)]
    pub fn need_preempt(&self) -> bool {
        self.preempt.need_preempt()
    }

    pub fn request_preemption(&self) {
        self.preempt.request_preemption();
    }

    pub fn reset_preemption_monitor(&self) {
        self.preempt.reset();
    }

    /// Makes the loop return to the pollers promptly.
    pub fn force_poll(&self) {
        self.request_preemption();
    }

    pub fn preemption_monitor(&self) -> &Arc<PreemptionMonitor> {
        &self.preempt
    }

    // ---- timers --------------------------------------------------------

    pub(crate) fn now(&self, source: ClockSource) -> Instant {
        match source {
            ClockSource::Steady => Instant::now(),
            ClockSource::Lowres => self.lowres_now.get(),
            ClockSource::Manual => self.manual_now.get(),
        }
    }

    pub(crate) fn queue_timer(&self, t: Rc<TimerInner>) {
        match t.source {
            ClockSource::Steady => {
                let new_earliest = self.steady_timers.borrow_mut().insert(t);
                if new_earliest {
                    if let Some(next) = self.steady_timers.borrow().get_next_timeout() {
                        self.backend.arm_highres_timer(next);
                    }
                }
            }
            ClockSource::Lowres => {
                self.lowres_timers.borrow_mut().insert(t);
                self.lowres_next_timeout
                    .set(self.lowres_timers.borrow().get_next_timeout());
            }
            ClockSource::Manual => {
                self.manual_timers.borrow_mut().insert(t);
            }
        }
    }

    pub(crate) fn dequeue_timer(&self, t: &TimerInner) {
        match t.source {
            ClockSource::Steady => self.steady_timers.borrow_mut().remove(t),
            ClockSource::Lowres => {
                self.lowres_timers.borrow_mut().remove(t);
                self.lowres_next_timeout
                    .set(self.lowres_timers.borrow().get_next_timeout());
            }
            ClockSource::Manual => self.manual_timers.borrow_mut().remove(t),
        }
    }

    /// Expires timers with deadline ≤ now in deadline order, running each
    /// callback in the timer's scheduling group. A panicking callback is
    /// reported and the shard carries on; periodic re-arm still happens.
    fn complete_timers(&self, source: ClockSource, now: Instant) -> usize {
        let expired = match source {
            ClockSource::Steady => self.steady_timers.borrow_mut().expire(now),
            ClockSource::Lowres => self.lowres_timers.borrow_mut().expire(now),
            ClockSource::Manual => self.manual_timers.borrow_mut().expire(now),
        };
        let n = expired.len();
        for t in expired {
            if t.period.get().is_none() {
                t.armed.set(false);
            }
            let prev = sched::set_current_scheduling_group(t.group.get());
            let mut cb = t.callback.borrow_mut().take();
            if let Some(f) = cb.as_mut() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f())) {
                    log::error!(
                        "timer callback failed on shard {}: {}",
                        self.id,
                        crate::smp::queue::panic_message(&panic)
                    );
                }
            }
            if t.callback.borrow().is_none() {
                *t.callback.borrow_mut() = cb;
            }
            sched::set_current_scheduling_group(prev);

            if let Some(period) = t.period.get() {
                // Cancelled between fire and re-arm stays cancelled.
                if t.armed.get() {
                    t.deadline.set(t.deadline.get() + period);
                    self.queue_timer(t);
                }
            }
        }
        if source == ClockSource::Lowres {
            self.lowres_next_timeout
                .set(self.lowres_timers.borrow().get_next_timeout());
        }
        n
    }

    fn service_highres_timer(&self) {
        let due = self
            .steady_timers
            .borrow()
            .get_next_timeout()
            .is_some_and(|next| next <= Instant::now());
        if due {
            self.complete_timers(ClockSource::Steady, Instant::now());
            if let Some(next) = self.steady_timers.borrow().get_next_timeout() {
                self.backend.arm_highres_timer(next);
            }
        }
    }

    pub(crate) fn do_expire_lowres_timers(&self) -> bool {
        let now = Instant::now();
        self.lowres_now.set(now);
        match self.lowres_next_timeout.get() {
            Some(next) if next <= now => self.complete_timers(ClockSource::Lowres, now) > 0,
            _ => false,
        }
    }

    /// Test-facing clock: advances the manual source and fires its timers.
    pub fn advance_manual_clock(&self, d: Duration) {
        let now = self.manual_now.get() + d;
        self.manual_now.set(now);
        self.complete_timers(ClockSource::Manual, now);
    }

    // ---- pollers -------------------------------------------------------

    /// Poller registration runs as a task because callers may themselves
    /// be inside a poll.
    pub fn register_poller(&self, p: Rc<dyn PollFn>) {
        self.add_task(Task::new(move || {
            shard::with_reactor(|r| r.pollers.borrow_mut().register(p));
        }));
    }

    pub fn unregister_poller(&self, p: Rc<dyn PollFn>) {
        self.add_task(Task::new(move || {
            shard::with_reactor(|r| r.pollers.borrow_mut().unregister(&p));
        }));
    }

    pub(crate) fn poll_once(&self) -> bool {
        self.pollers.borrow().poll_all()
    }

    pub(crate) fn pure_poll_once(&self) -> bool {
        self.pollers.borrow().pure_poll_all()
    }

    /// The fixed poller order is load-bearing: submissions made by one
    /// poller feed completions into later pollers within the same
    /// iteration instead of waiting out a task quota.
    fn register_builtin_pollers(self: &Rc<Self>) {
        let mut pollers = self.pollers.borrow_mut();
        let weak = Rc::downgrade(self);
        pollers.register(Rc::new(SmpPoller(weak.clone())));
        pollers.register(Rc::new(ReapKernelCompletionsPoller(weak.clone())));
        pollers.register(Rc::new(IoQueueSubmissionPoller(weak.clone())));
        pollers.register(Rc::new(KernelSubmitPoller(weak.clone())));
        pollers.register(Rc::new(ReapKernelCompletionsPoller(weak.clone())));
        pollers.register(Rc::new(SyscallCompletionsPoller(weak.clone())));
        pollers.register(Rc::new(LowresTimerPoller(weak.clone())));
        pollers.register(Rc::new(SignalPoller(weak)));
    }

    pub fn set_idle_cpu_handler(
        &self,
        handler: impl FnMut(&mut dyn FnMut() -> bool) -> IdleCpuHandlerResult + 'static,
    ) {
        *self.idle_cpu_handler.borrow_mut() = Some(Box::new(handler));
    }

    // ---- I/O and syscalls ----------------------------------------------

    /// Admission-controlled asynchronous I/O on the default device queue.
    pub fn queue_io_request(
        &self,
        pc: IoPriorityClass,
        len: usize,
        request: IoRequest,
        intent: Option<&IoIntent>,
    ) -> Future<usize> {
        let queue = self.io_queues.borrow()[0].1.clone();
        queue.queue_request(pc, len, request, intent)
    }

    pub fn io_queue_for_device(&self, dev: u64) -> Option<Rc<IoQueue>> {
        self.io_queues
            .borrow()
            .iter()
            .find(|(d, _)| *d == dev)
            .map(|(_, q)| q.clone())
    }

    /// Runs a blocking operation on the syscall thread pool; the reactor
    /// thread never blocks.
    pub fn submit_syscall<T, F>(&self, func: F) -> Future<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.syscall_pool
            .borrow()
            .as_ref()
            .expect("syscall pool not installed on this shard")
            .submit(func)
    }

    /// Renames an I/O priority class everywhere. The registry update is
    /// immediate; shards refresh their snapshots via cross-shard
    /// invocation.
    pub fn rename_io_priority_class(&self, pc: IoPriorityClass, new_name: String) -> Future<()> {
        if !crate::io::priority::rename_priority_class(pc, new_name) {
            return Future::ready(());
        }
        if self.all_ctls.borrow().len() <= 1 {
            return Future::ready(());
        }
        smp::invoke_on_all(|| {
            // Touching the snapshot is enough; per-shard caches reload on
            // the generation bump.
            let _ = crate::io::priority::snapshot();
        })
    }

    // ---- shutdown ------------------------------------------------------

    /// Registers a function to run during shutdown; functions run in
    /// reverse registration order, exactly once per shard.
    pub fn at_exit(&self, f: impl FnOnce() + 'static) {
        self.exit_funcs.borrow_mut().push(Box::new(f));
    }

    pub(crate) fn run_exit_funcs(&self) {
        loop {
            let f = self.exit_funcs.borrow_mut().pop();
            let Some(f) = f else { break };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                log::error!(
                    "at-exit function failed on shard {}: {}",
                    self.id,
                    crate::smp::queue::panic_message(&panic)
                );
            }
        }
    }

    /// Initiates shutdown. Only invokable on shard 0: runs at-exit
    /// functions locally, then on every other shard, and finally raises
    /// the stopped flag fleet-wide.
    pub fn stop(&self) {
        assert_eq!(self.id, 0, "stop() may only be invoked from shard 0");
        if self.stopping.replace(true) {
            return;
        }
        self.run_exit_funcs();
        let others = self.shard_count() - 1;
        if others == 0 {
            self.finalize_stop();
            return;
        }
        smp::invoke_on_others(|| {
            shard::with_reactor(|r| r.run_exit_funcs());
        })
        .handle(|r| {
            if let Err(e) = r {
                log::error!("cross-shard at-exit invocation failed: {e}");
            }
            shard::with_reactor(|r| r.finalize_stop());
        });
    }

    fn finalize_stop(&self) {
        let ctls = self.all_ctls.borrow();
        if ctls.is_empty() {
            self.ctl.set_stopped();
            self.ctl.notifier.maybe_notify();
            return;
        }
        for ctl in ctls.iter() {
            ctl.set_stopped();
            ctl.notifier.maybe_notify();
        }
    }

    /// Schedules `stop()` on shard 0 with a captured exit code.
    pub fn exit(&self, code: i32) {
        if self.id == 0 {
            self.ctl.return_code.store(code, Ordering::Release);
            self.stop();
        } else {
            smp::submit_to(0, move || {
                shard::with_reactor(|r| {
                    r.ctl.return_code.store(code, Ordering::Release);
                    r.stop();
                });
            })
            .handle(|r| {
                let _ = r;
            });
        }
    }

    // ---- the loop ------------------------------------------------------

    /// Drives this shard until `stop()` is observed; returns the exit
    /// code configured via [`exit`](Reactor::exit).
    pub fn run(&self) -> i32 {
        self.backend.start_tick();
        self.backend.start_handling_signal();

        // 1s load refresh on the low-res clock.
        let load_timer = Timer::new_lowres(|| {
            shard::with_reactor(|r| r.refresh_load());
        });
        load_timer.arm_periodic(Duration::from_secs(1));

        let mut idle = false;
        let mut idle_start = Instant::now();
        let mut idle_end = idle_start;

        loop {
            self.run_some_tasks();
            self.service_highres_timer();

            if self.ctl.is_stopped() {
                self.ctl.set_state(ShardState::DrainingTasks);
                load_timer.cancel();
                // Final tasks may include sending the last response to
                // shard 0, so run them all.
                while self.have_more_tasks() {
                    self.run_some_tasks();
                }
                self.drain_at_exit_queue();
                self.ctl.set_state(ShardState::Stopped);
                let barrier = self.shutdown_barrier.borrow_mut().take();
                if let Some(barrier) = barrier {
                    barrier.wait();
                }
                break;
            }

            self.polls.set(self.polls.get() + 1);

            if self.poll_once() || self.have_more_tasks() {
                if idle {
                    let span = idle_end - idle_start;
                    self.total_idle.set(self.total_idle.get() + span);
                    idle = false;
                }
                continue;
            }

            idle_end = Instant::now();
            if !idle {
                idle_start = idle_end;
                idle = true;
            }

            let go_to_sleep = self.run_idle_cpu_handler();
            if go_to_sleep {
                std::hint::spin_loop();
                if !self.cfg.poll_mode && idle_end - idle_start > self.cfg.idle_poll_time {
                    let start_sleep = Instant::now();
                    self.try_sleep();
                    idle_end = Instant::now();
                    self.total_sleep
                        .set(self.total_sleep.get() + (idle_end - start_sleep));
                }
            } else {
                // The handler only ran the pure check; it may not have
                // performed real work, so poll properly now.
                let _ = self.poll_once();
            }
        }

        self.backend.stop_tick();
        self.io_queues.borrow_mut().clear();
        self.ctl.return_code.load(Ordering::Acquire)
    }

    fn drain_at_exit_queue(&self) {
        loop {
            let empty = self.queues.borrow()[SchedulingGroup::AT_EXIT.index()]
                .as_ref()
                .unwrap()
                .q
                .is_empty();
            if empty {
                break;
            }
            self.preempt.reset();
            self.run_tasks(SchedulingGroup::AT_EXIT);
        }
        sched::set_current_scheduling_group(SchedulingGroup::MAIN);
    }

    /// Runs the installed idle handler against the pure-poll predicate.
    /// True means "no more work, sleeping is allowed".
    fn run_idle_cpu_handler(&self) -> bool {
        let mut handler = self.idle_cpu_handler.borrow_mut();
        let Some(handler) = handler.as_mut() else {
            return true;
        };
        let mut check = || self.pure_poll_once() || self.have_more_tasks();
        match catch_unwind(AssertUnwindSafe(|| handler(&mut check))) {
            Ok(result) => result == IdleCpuHandlerResult::NoMoreWork,
            Err(panic) => {
                log::error!(
                    "idle cpu handler failed on shard {}: {}",
                    self.id,
                    crate::smp::queue::panic_message(&panic)
                );
                true
            }
        }
    }

    /// Blocks in the backend until woken. Every poller first converts to
    /// interrupt mode (rewinding if any refuses), the quota timer is
    /// paused, and the stall detector stands down for the duration.
    fn try_sleep(&self) {
        if !self.pollers.borrow().try_enter_interrupt_mode() {
            return;
        }
        self.backend.stop_tick();
        if let Some(stall) = &*self.stall.borrow() {
            stall.start_sleep();
        }

        self.backend.wait_and_process_events(None);

        self.ctl.notifier.wake_up();
        self.ctl.notifier.consume();
        if let Some(stall) = &*self.stall.borrow() {
            stall.end_sleep();
        }
        self.pollers.borrow().exit_interrupt_mode();
        self.backend.start_tick();
    }

    fn refresh_load(&self) {
        let total_idle = self.total_idle.get();
        let idle_delta = total_idle - self.last_idle.get();
        self.last_idle.set(total_idle);
        let load = (1.0 - idle_delta.as_secs_f64()).clamp(0.0, 1.0);

        let mut loads = self.loads.borrow_mut();
        loads.push_front(load);
        if loads.len() > LOAD_WINDOW {
            let dropped = loads.pop_back().unwrap();
            self.load.set(self.load.get() - dropped / LOAD_WINDOW as f64);
        }
        self.load.set(self.load.get() + load / LOAD_WINDOW as f64);
    }

    /// Live-tunes the stall threshold (`--blocked-reactor-notify-ms`).
    pub fn update_blocked_reactor_notify(&self, threshold: Duration) {
        if let Some(stall) = &*self.stall.borrow() {
            stall.update_threshold(threshold);
        }
    }

    /// Installs the stall-report callback; the default logs a one-line
    /// diagnostic through the `log` facade.
    pub fn set_stall_report_hook(&self, f: impl Fn(&str) + 'static) {
        if let Some(stall) = &*self.stall.borrow() {
            stall.set_report_hook(f);
        }
    }

    // ---- metrics -------------------------------------------------------

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Relaxed)
    }

    pub fn stall_reports(&self) -> u64 {
        self.stall
            .borrow()
            .as_ref()
            .map(|s| s.total_reported())
            .unwrap_or(0)
    }

    /// Totals of cross-shard messages sent and received by this shard.
    pub fn smp_counters(&self) -> (u64, u64) {
        let sent = self.senders.borrow().iter().map(|s| s.sent()).sum();
        let received = self.receivers.borrow().iter().map(|r| r.received()).sum();
        (sent, received)
    }

    /// Per-peer counters: the outgoing channel to `other` merged with the
    /// incoming channel from it.
    pub fn smp_queue_stats(&self, other: ShardId) -> Option<smp::SmpQueueStats> {
        let tx = self
            .senders
            .borrow()
            .iter()
            .find(|s| s.to == other)
            .map(|s| s.stats())?;
        let rx = self
            .receivers
            .borrow()
            .iter()
            .find(|r| r.from == other)
            .map(|r| r.stats())
            .unwrap_or_default();
        Some(smp::SmpQueueStats {
            received: rx.received,
            last_receive_batch: rx.last_receive_batch,
            ..tx
        })
    }

    pub fn polls(&self) -> u64 {
        self.polls.get()
    }

    pub fn total_idle(&self) -> Duration {
        self.total_idle.get()
    }

    pub fn total_sleep(&self) -> Duration {
        self.total_sleep.get()
    }

    pub fn load(&self) -> f64 {
        self.load.get()
    }

    pub fn state(&self) -> ShardState {
        self.ctl.state()
    }

    pub fn abandoned_failed_futures(&self) -> u64 {
        crate::future::abandoned_failed_futures()
    }
}

/// Snapshot of one task queue's accounting.
#[derive(Debug, Clone)]
pub struct TaskQueueStats {
    pub shares: f32,
    pub vruntime: u64,
    pub runtime: Duration,
    pub waittime: Duration,
    pub starvetime: Duration,
    pub tasks_processed: u64,
    pub time_spent_on_task_quota_violations: Duration,
    pub backlog: usize,
}

// ---- built-in pollers --------------------------------------------------

/// Cross-shard inbox: flush outgoing batches, run incoming work, drain
/// completion messages and expired submission deadlines.
struct SmpPoller(Weak<Reactor>);

impl PollFn for SmpPoller {
    fn poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        let mut work = false;
        let now = Instant::now();
        for tx in r.senders.borrow().iter() {
            work |= tx.flush_request_batch();
            work |= tx.process_completions() > 0;
            tx.reap_expired(now);
        }
        for rx in r.receivers.borrow().iter() {
            work |= rx.process_incoming() > 0;
            work |= rx.flush_response_batch();
        }
        work
    }

    fn pure_poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        r.receivers.borrow().iter().any(|rx| rx.pure_poll_rx())
            || r.senders.borrow().iter().any(|tx| tx.pure_poll_tx())
    }

    /// Publishes the sleeping flag, then re-checks the rings: a message
    /// that raced the flag means we must not sleep.
    fn try_enter_interrupt_mode(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return true;
        };
        r.ctl.notifier.prepare_to_sleep();
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        if self.pure_poll() {
            r.ctl.notifier.wake_up();
            return false;
        }
        true
    }

    fn exit_interrupt_mode(&self) {
        if let Some(r) = self.0.upgrade() {
            r.ctl.notifier.wake_up();
        }
    }
}

/// Collects finished kernel operations.
struct ReapKernelCompletionsPoller(Weak<Reactor>);

impl PollFn for ReapKernelCompletionsPoller {
    fn poll(&self) -> bool {
        self.0
            .upgrade()
            .map(|r| r.backend.reap_kernel_completions())
            .unwrap_or(false)
    }

    fn pure_poll(&self) -> bool {
        false
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        self.0
            .upgrade()
            .map(|r| r.backend.kernel_events_can_sleep())
            .unwrap_or(true)
    }
}

/// Shapes and admits queued I/O into the backend staging area.
struct IoQueueSubmissionPoller(Weak<Reactor>);

impl PollFn for IoQueueSubmissionPoller {
    fn poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        let now = Instant::now();
        let mut admitted = 0;
        for (_, q) in r.io_queues.borrow().iter() {
            admitted += q.dispatch(now, &mut |pending| r.backend.submit_io(pending));
        }
        admitted > 0
    }

    fn pure_poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        let now = Instant::now();
        let result = r
            .io_queues
            .borrow()
            .iter()
            .any(|(_, q)| q.queued() > 0 && q.next_pending_aio(now).is_none());
        result
    }

    /// Before sleeping, arm a wakeup for the earliest time a queued
    /// request might become admissible.
    fn try_enter_interrupt_mode(&self) -> bool {
        if let Some(r) = self.0.upgrade() {
            let now = Instant::now();
            let next = r
                .io_queues
                .borrow()
                .iter()
                .filter_map(|(_, q)| q.next_pending_aio(now))
                .min();
            if let Some(next) = next {
                r.backend.arm_highres_timer(next);
            }
        }
        true
    }
}

/// Pushes staged submissions into the kernel.
struct KernelSubmitPoller(Weak<Reactor>);

impl PollFn for KernelSubmitPoller {
    fn poll(&self) -> bool {
        self.0
            .upgrade()
            .map(|r| r.backend.kernel_submit_work())
            .unwrap_or(false)
    }

    fn pure_poll(&self) -> bool {
        false
    }
}

/// Resumes futures waiting on the blocking-syscall thread pool.
struct SyscallCompletionsPoller(Weak<Reactor>);

impl PollFn for SyscallCompletionsPoller {
    fn poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        let pool = r.syscall_pool.borrow();
        pool.as_ref().map(|p| p.complete() > 0).unwrap_or(false)
    }

    fn pure_poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        let pool = r.syscall_pool.borrow();
        pool.as_ref().map(|p| p.has_completions()).unwrap_or(false)
    }
}

/// Refreshes the low-resolution clock and expires its timers.
struct LowresTimerPoller(Weak<Reactor>);

impl PollFn for LowresTimerPoller {
    fn poll(&self) -> bool {
        self.0
            .upgrade()
            .map(|r| r.do_expire_lowres_timers())
            .unwrap_or(false)
    }

    fn pure_poll(&self) -> bool {
        self.0
            .upgrade()
            .and_then(|r| r.lowres_next_timeout.get())
            .is_some_and(|next| next <= Instant::now())
    }
}

/// Delivers process signals; shard 0 turns SIGINT/SIGTERM into `stop()`.
struct SignalPoller(Weak<Reactor>);

impl PollFn for SignalPoller {
    fn poll(&self) -> bool {
        let Some(r) = self.0.upgrade() else {
            return false;
        };
        if r.id != 0 || !r.cfg.auto_handle_sigint_sigterm {
            return false;
        }
        match smp::take_caught_termination_signal() {
            Some(sig) => {
                log::info!("caught signal {sig}; stopping");
                r.stop();
                true
            }
            None => false,
        }
    }

    fn pure_poll(&self) -> bool {
        false
    }
}
