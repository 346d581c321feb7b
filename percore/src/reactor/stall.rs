use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{self, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shard::ShardId;

/// Fraction of the threshold added as slack so the timer doesn't race the
/// dispatcher on a batch that finishes exactly at the threshold.
const SLACK_FRACTION: f64 = 0.2;

const SCRATCH_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct StallDetectorConfig {
    pub(crate) threshold: Duration,
    pub(crate) reports_per_minute: u32,
    pub(crate) shard: ShardId,
}

/// Bytes the signal handler formats its diagnostic into; the main loop
/// flushes it at the next quiescent point. The handler and the flusher
/// run on the same thread (the CPU-time timer signal is delivered to the
/// stalled thread itself), so access is interruption, not concurrency.
struct ScratchBuffer {
    buf: UnsafeCell<[u8; SCRATCH_SIZE]>,
    len: AtomicUsize,
    pending: AtomicBool,
}

impl ScratchBuffer {
    fn new() -> ScratchBuffer {
        ScratchBuffer {
            buf: UnsafeCell::new([0; SCRATCH_SIZE]),
            len: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
        }
    }

    /// Async-signal-safe: plain byte stores plus relaxed atomics.
    fn write(&self, parts: &[&[u8]]) {
        let buf = unsafe { &mut *self.buf.get() };
        let mut at = 0;
        for part in parts {
            let n = part.len().min(SCRATCH_SIZE - at);
            buf[at..at + n].copy_from_slice(&part[..n]);
            at += n;
            if at == SCRATCH_SIZE {
                break;
            }
        }
        self.len.store(at, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<String> {
        if self.pending.swap(false, Ordering::Acquire) {
            let len = self.len.load(Ordering::Relaxed);
            let buf = unsafe { &*self.buf.get() };
            Some(String::from_utf8_lossy(&buf[..len]).into_owned())
        } else {
            None
        }
    }
}

/// Formats `v` into `out`, returning the used prefix. No allocation, so
/// the signal handler can use it.
fn format_u64(v: u64, out: &mut [u8; 20]) -> &[u8] {
    let mut v = v;
    let mut at = out.len();
    loop {
        at -= 1;
        out[at] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    &out[at..]
}

/// State the signal handler reads and writes. Everything is an atomic or
/// the same-thread scratch buffer, keeping the handler async-signal-safe.
pub(crate) struct SignalShared {
    tasks_processed: Arc<AtomicU64>,
    /// Zero means "detector inactive" (between task batches or asleep).
    last_tasks_processed_seen: AtomicU64,
    /// Exponential back-off multiplier applied to the re-arm interval.
    report_at: AtomicU32,
    reported: AtomicU32,
    max_reports_per_minute: u32,
    threshold_ns: AtomicU64,
    slack_ns: AtomicU64,
    run_started_ns: AtomicU64,
    total_reported: AtomicU64,
    shard: ShardId,
    /// `timer_t` as usize; zero when no OS timer exists (tests).
    timer: AtomicUsize,
    scratch: ScratchBuffer,
}

impl SignalShared {
    fn new(cfg: &StallDetectorConfig, tasks_processed: Arc<AtomicU64>) -> SignalShared {
        let threshold_ns = cfg.threshold.as_nanos() as u64;
        SignalShared {
            tasks_processed,
            last_tasks_processed_seen: AtomicU64::new(0),
            report_at: AtomicU32::new(1),
            reported: AtomicU32::new(0),
            max_reports_per_minute: cfg.reports_per_minute,
            threshold_ns: AtomicU64::new(threshold_ns),
            slack_ns: AtomicU64::new((threshold_ns as f64 * SLACK_FRACTION) as u64),
            run_started_ns: AtomicU64::new(0),
            total_reported: AtomicU64::new(0),
            shard: cfg.shard,
            timer: AtomicUsize::new(0),
            scratch: ScratchBuffer::new(),
        }
    }

    /// The whole handler. Reads relaxed atomics, formats into the scratch
    /// buffer, re-arms the CPU-time timer; nothing here allocates or locks.
    fn on_signal(&self) {
        let processed = self.tasks_processed.load(Ordering::Relaxed);
        let last_seen = self.last_tasks_processed_seen.load(Ordering::Relaxed);
        if last_seen == 0 {
            return; // not inside a task batch
        }
        if last_seen == processed {
            self.maybe_report();
            let at = self.report_at.load(Ordering::Relaxed);
            self.report_at.store(at << 1, Ordering::Relaxed);
        } else {
            self.last_tasks_processed_seen
                .store(processed, Ordering::Relaxed);
        }
        self.arm_timer();
    }

    fn maybe_report(&self) {
        let reported = self.reported.fetch_add(1, Ordering::Relaxed);
        if reported >= self.max_reports_per_minute {
            return; // suppressed; counted at the minute rollover
        }
        self.total_reported.fetch_add(1, Ordering::Relaxed);

        let stalled_ms = self.stall_duration_ns() / 1_000_000;
        let mut ms_buf = [0u8; 20];
        let mut shard_buf = [0u8; 20];
        self.scratch.write(&[
            b"Reactor stalled for ~",
            format_u64(stalled_ms, &mut ms_buf),
            b" ms on shard ",
            format_u64(self.shard as u64, &mut shard_buf),
        ]);
    }

    fn stall_duration_ns(&self) -> u64 {
        monotonic_ns().saturating_sub(self.run_started_ns.load(Ordering::Relaxed))
    }

    fn next_arm_interval_ns(&self) -> u64 {
        let threshold = self.threshold_ns.load(Ordering::Relaxed);
        let at = self.report_at.load(Ordering::Relaxed) as u64;
        threshold * at + self.slack_ns.load(Ordering::Relaxed)
    }

    /// Re-arms the one-shot CPU-time timer. `timer_settime` is on the
    /// async-signal-safe list, so the handler may call this too.
    fn arm_timer(&self) {
        let timer = self.timer.load(Ordering::Relaxed);
        if timer == 0 {
            return;
        }
        let ns = self.next_arm_interval_ns();
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (ns % 1_000_000_000) as libc::c_long,
            },
        };
        unsafe {
            libc::timer_settime(timer as libc::timer_t, 0, &its, std::ptr::null_mut());
        }
    }

    fn disarm_timer(&self) {
        let timer = self.timer.load(Ordering::Relaxed);
        if timer == 0 {
            return;
        }
        let zero: libc::itimerspec = unsafe { std::mem::zeroed() };
        unsafe {
            libc::timer_settime(timer as libc::timer_t, 0, &zero, std::ptr::null_mut());
        }
    }
}

// Raw CLOCK_MONOTONIC read; async-signal-safe, unlike Instant arithmetic
// on some platforms.
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

thread_local! {
    static SIGNAL_STATE: Cell<*const SignalShared> = const { Cell::new(std::ptr::null()) };
}

#[cfg(target_os = "linux")]
extern "C" fn stall_signal_handler(_sig: libc::c_int) {
    let ptr = SIGNAL_STATE.with(|p| p.get());
    if !ptr.is_null() {
        unsafe { (*ptr).on_signal() };
    }
}

#[cfg(target_os = "linux")]
fn signal_number() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

#[cfg(target_os = "linux")]
fn install_signal_handler() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = stall_signal_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigaction(signal_number(), &sa, std::ptr::null_mut());
    });
}

/// Detects a task holding the CPU beyond the configured threshold.
///
/// A per-thread CPU-time timer fires a signal at `threshold` of consumed
/// CPU; the handler compares `tasks_processed` against the last sample
/// and, if the shard made no progress, files a rate-limited diagnostic
/// and doubles its back-off.
pub(crate) struct CpuStallDetector {
    shared: Arc<SignalShared>,
    threshold: Cell<Duration>,
    rearm_timer_at: Cell<Instant>,
    minute_mark: Cell<Instant>,
    report_hook: RefCell<Option<Box<dyn Fn(&str)>>>,
}

impl CpuStallDetector {
    pub(crate) fn new(
        cfg: StallDetectorConfig,
        tasks_processed: Arc<AtomicU64>,
    ) -> CpuStallDetector {
        let d = CpuStallDetector::without_timer(cfg, tasks_processed);
        d.create_os_timer();
        d
    }

    /// Timer-less detector; tests drive `shared` by hand.
    pub(crate) fn without_timer(
        cfg: StallDetectorConfig,
        tasks_processed: Arc<AtomicU64>,
    ) -> CpuStallDetector {
        let shared = Arc::new(SignalShared::new(&cfg, tasks_processed));
        SIGNAL_STATE.with(|p| p.set(Arc::as_ptr(&shared)));
        CpuStallDetector {
            shared,
            threshold: Cell::new(cfg.threshold),
            rearm_timer_at: Cell::new(Instant::now()),
            minute_mark: Cell::new(Instant::now()),
            report_hook: RefCell::new(None),
        }
    }

    #[cfg(target_os = "linux")]
    fn create_os_timer(&self) {
        install_signal_handler();
        unsafe {
            let mut sev: libc::sigevent = std::mem::zeroed();
            sev.sigev_notify = libc::SIGEV_THREAD_ID;
            sev.sigev_signo = signal_number();
            sev.sigev_notify_thread_id = libc::syscall(libc::SYS_gettid) as libc::c_int;
            let mut timer: libc::timer_t = std::ptr::null_mut();
            let r = libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut timer);
            if r == 0 {
                self.shared.timer.store(timer as usize, Ordering::Relaxed);
            } else {
                log::warn!(
                    "stall detector disabled: timer_create failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn create_os_timer(&self) {}

    /// Installs the report callback; the default logs the diagnostic.
    pub(crate) fn set_report_hook(&self, f: impl Fn(&str) + 'static) {
        *self.report_hook.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn start_task_run(&self, now: Instant) {
        if now > self.rearm_timer_at.get() {
            self.report_suppressions(now);
            self.shared.report_at.store(1, Ordering::Relaxed);
            self.shared
                .run_started_ns
                .store(monotonic_ns(), Ordering::Relaxed);
            self.rearm_timer_at.set(now + self.threshold.get());
            self.shared.arm_timer();
        }
        self.shared.last_tasks_processed_seen.store(
            self.shared.tasks_processed.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        // Don't let the store drift past the batch it guards.
        atomic::compiler_fence(Ordering::Release);
    }

    pub(crate) fn end_task_run(&self, _now: Instant) {
        atomic::compiler_fence(Ordering::Acquire);
        self.shared
            .last_tasks_processed_seen
            .store(0, Ordering::Relaxed);
        self.flush_report();
    }

    pub(crate) fn start_sleep(&self) {
        self.shared.disarm_timer();
        self.rearm_timer_at.set(Instant::now());
    }

    pub(crate) fn end_sleep(&self) {}

    /// Emits the "suppressed N backtraces" line once per minute rollover.
    pub(crate) fn report_suppressions(&self, now: Instant) {
        if now > self.minute_mark.get() + Duration::from_secs(60) {
            let reported = self.shared.reported.load(Ordering::Relaxed);
            if reported > self.shared.max_reports_per_minute {
                let suppressed = reported - self.shared.max_reports_per_minute;
                let noun = if suppressed == 1 {
                    "backtrace"
                } else {
                    "backtraces"
                };
                self.emit(&format!(
                    "Rate-limit: suppressed {suppressed} {noun} on shard {}",
                    self.shared.shard
                ));
            }
            self.shared.reported.store(0, Ordering::Relaxed);
            self.minute_mark.set(now);
        }
    }

    pub(crate) fn flush_report(&self) {
        if let Some(line) = self.shared.scratch.take() {
            self.emit(&line);
        }
    }

    fn emit(&self, line: &str) {
        match &*self.report_hook.borrow() {
            Some(hook) => hook(line),
            None => log::warn!("{line}"),
        }
    }

    pub(crate) fn update_threshold(&self, threshold: Duration) {
        self.threshold.set(threshold);
        let ns = threshold.as_nanos() as u64;
        self.shared.threshold_ns.store(ns, Ordering::Relaxed);
        self.shared
            .slack_ns
            .store((ns as f64 * SLACK_FRACTION) as u64, Ordering::Relaxed);
    }

    pub(crate) fn total_reported(&self) -> u64 {
        self.shared.total_reported.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &SignalShared {
        &self.shared
    }
}

impl Drop for CpuStallDetector {
    fn drop(&mut self) {
        SIGNAL_STATE.with(|p| p.set(std::ptr::null()));
        let timer = self.shared.timer.swap(0, Ordering::Relaxed);
        #[cfg(target_os = "linux")]
        if timer != 0 {
            unsafe {
                libc::timer_delete(timer as libc::timer_t);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = timer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU64;

    fn detector(reports_per_minute: u32) -> (CpuStallDetector, Arc<AtomicU64>) {
        let tasks = Arc::new(AtomicU64::new(1));
        let cfg = StallDetectorConfig {
            threshold: Duration::from_millis(50),
            reports_per_minute,
            shard: 3,
        };
        (
            CpuStallDetector::without_timer(cfg, tasks.clone()),
            tasks,
        )
    }

    fn collect_reports(d: &CpuStallDetector) -> Rc<RefCell<Vec<String>>> {
        let reports = Rc::new(RefCell::new(Vec::new()));
        let reports2 = reports.clone();
        d.set_report_hook(move |line| reports2.borrow_mut().push(line.to_string()));
        reports
    }

    #[test]
    fn no_report_when_tasks_progress() {
        let (d, tasks) = detector(5);
        let reports = collect_reports(&d);

        d.start_task_run(Instant::now());
        tasks.fetch_add(1, Ordering::Relaxed);
        d.shared().on_signal();
        d.end_task_run(Instant::now());

        assert!(reports.borrow().is_empty());
        assert_eq!(d.total_reported(), 0);
    }

    #[test]
    fn stalled_batch_reports_and_backs_off() {
        let (d, _tasks) = detector(5);
        let reports = collect_reports(&d);

        d.start_task_run(Instant::now());
        d.shared().on_signal();
        d.flush_report();
        d.shared().on_signal();
        d.flush_report();

        let reports = reports.borrow();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].contains("Reactor stalled for ~"), "{}", reports[0]);
        assert!(reports[0].contains("on shard 3"), "{}", reports[0]);
        // Two no-progress signals double the back-off twice: 1 → 2 → 4.
        assert_eq!(d.shared().report_at.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn reports_are_rate_limited_per_minute() {
        let (d, _tasks) = detector(3);
        let reports = collect_reports(&d);

        let t0 = Instant::now();
        d.start_task_run(t0);
        for _ in 0..10 {
            d.shared().on_signal();
            d.flush_report();
        }
        assert_eq!(reports.borrow().len(), 3, "limit of 3 per minute");

        // Minute rollover: one suppression line for the other 7.
        d.report_suppressions(t0 + Duration::from_secs(61));
        let reports = reports.borrow();
        assert_eq!(reports.len(), 4);
        assert!(
            reports[3].contains("suppressed 7 backtraces on shard 3"),
            "{}",
            reports[3]
        );
    }

    #[test]
    fn inactive_detector_ignores_signals() {
        let (d, _tasks) = detector(5);
        let reports = collect_reports(&d);

        // No start_task_run: last_seen stays 0, the inactive sentinel.
        d.shared().on_signal();
        d.flush_report();
        assert!(reports.borrow().is_empty());
    }

    #[test]
    fn end_task_run_deactivates() {
        let (d, _tasks) = detector(5);
        let reports = collect_reports(&d);

        d.start_task_run(Instant::now());
        d.end_task_run(Instant::now());
        d.shared().on_signal();
        d.flush_report();
        assert!(reports.borrow().is_empty());
    }

    #[test]
    fn format_u64_renders_decimal() {
        let mut buf = [0u8; 20];
        assert_eq!(format_u64(0, &mut buf), b"0");
        let mut buf = [0u8; 20];
        assert_eq!(format_u64(507, &mut buf), b"507");
        let mut buf = [0u8; 20];
        assert_eq!(format_u64(u64::MAX, &mut buf), b"18446744073709551615");
    }
}
