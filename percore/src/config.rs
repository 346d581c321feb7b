use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::error::{Error, FatalError, ParseError, ParseErrorKind, Result};
use crate::utils::{self, parse_size};

/// Minimum task quota; a configured quota of zero is raised to this.
pub(crate) const MIN_TASK_QUOTA: Duration = Duration::from_millis(1);

const DEFAULT_IDLE_POLL_TIME_US: u64 = 200;
const DEFAULT_IDLE_POLL_TIME_VIRTUALIZED_US: u64 = 2000;

/// Command-line surface of the runtime.
///
/// `--overprovisioned` is a macro flag: it implies `--idle-poll-time-us 0
/// --thread-affinity false --poll-aio false` for machines shared with
/// other loads.
#[derive(Debug, Clone, Parser)]
#[command(name = "percore")]
pub struct ReactorOpts {
    /// Max time (ms) between polls and between task-quota preemptions.
    #[arg(long, default_value_t = 0.5)]
    pub task_quota_ms: f64,

    /// Busy-poll for this long before going to sleep when idle.
    /// Defaults to 200us, or 2000us when virtualization is detected.
    #[arg(long)]
    pub idle_poll_time_us: Option<u64>,

    /// Never sleep; poll continuously.
    #[arg(long)]
    pub poll_mode: bool,

    /// Threshold (ms) beyond which a task holding the CPU is a stall.
    #[arg(long, default_value_t = 20_000)]
    pub blocked_reactor_notify_ms: u64,

    /// Maximum number of stall reports per minute.
    #[arg(long, default_value_t = 5)]
    pub blocked_reactor_reports_per_minute: u32,

    /// Maximum backlog at which preemption still interrupts a task queue.
    #[arg(long, default_value_t = 1000)]
    pub max_task_backlog: usize,

    /// Busy-poll for disk I/O completions.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub poll_aio: bool,

    /// Backend selector; resolved by the embedding application.
    #[arg(long, default_value = "default")]
    pub reactor_backend: String,

    /// Number of shards (default: one per available CPU).
    #[arg(long)]
    pub smp: Option<usize>,

    /// CPUs to pin shards to, e.g. "0-3,7".
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Memory to use, e.g. "4G".
    #[arg(long)]
    pub memory: Option<String>,

    /// Memory to reserve for the OS, e.g. "1G".
    #[arg(long)]
    pub reserve_memory: Option<String>,

    /// Path to a hugetlbfs mount to back memory with.
    #[arg(long)]
    pub hugepages: Option<PathBuf>,

    /// mlock() all memory at boot.
    #[arg(long)]
    pub lock_memory: bool,

    /// Pin each shard thread to its CPU.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub thread_affinity: bool,

    /// Number of I/O groups sharing each device's budget
    /// (default: one per shard).
    #[arg(long)]
    pub num_io_groups: Option<usize>,

    /// Path to the I/O shaping properties document.
    #[arg(long)]
    pub io_properties_file: Option<PathBuf>,

    /// Inline I/O shaping properties document.
    #[arg(long)]
    pub io_properties: Option<String>,

    /// Tune for a machine shared with other loads.
    #[arg(long)]
    pub overprovisioned: bool,

    /// Multiplier for shard 0's memory share.
    #[arg(long, default_value_t = 1)]
    pub shard0_memory_scale: usize,

    /// Dump memory diagnostics and abort on allocation failure instead of
    /// surfacing an error to the caller.
    #[arg(long)]
    pub abort_on_alloc_failure: bool,
}

impl Default for ReactorOpts {
    fn default() -> Self {
        ReactorOpts::parse_from::<_, &str>([])
    }
}

/// Per-reactor knobs, validated.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub task_quota: Duration,
    pub idle_poll_time: Duration,
    pub poll_mode: bool,
    pub blocked_reactor_notify: Duration,
    pub blocked_reactor_reports_per_minute: u32,
    pub max_task_backlog: usize,
    pub poll_aio: bool,
    pub backend: String,
    pub auto_handle_sigint_sigterm: bool,
    pub abort_on_alloc_failure: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        SmpConfig::try_from(ReactorOpts::default())
            .expect("default options validate")
            .reactor
    }
}

/// Whole-fleet configuration, validated. Produced from [`ReactorOpts`] by
/// `TryFrom`; construction is the only path, so a value of this type is
/// known-good.
#[derive(Debug, Clone)]
pub struct SmpConfig {
    pub shards: usize,
    /// CPU ids shards are pinned to, one per shard (cycled if shorter).
    pub cpuset: Vec<usize>,
    pub memory: Option<u64>,
    pub reserve_memory: Option<u64>,
    pub hugepages: Option<PathBuf>,
    pub lock_memory: bool,
    pub thread_affinity: bool,
    pub shard0_memory_scale: usize,
    pub num_io_groups: usize,
    pub io_properties_file: Option<PathBuf>,
    pub io_properties: Option<String>,
    pub reactor: ReactorConfig,
}

impl Default for SmpConfig {
    fn default() -> Self {
        SmpConfig::try_from(ReactorOpts::default()).expect("default options validate")
    }
}

impl SmpConfig {
    /// Single-shard config used heavily by tests.
    pub fn single_shard() -> SmpConfig {
        let mut cfg = SmpConfig::default();
        cfg.shards = 1;
        cfg.cpuset.truncate(1);
        cfg
    }

    pub fn cpu_for_shard(&self, shard: usize) -> usize {
        self.cpuset[shard % self.cpuset.len()]
    }
}

impl TryFrom<ReactorOpts> for SmpConfig {
    type Error = Error;

    fn try_from(mut opts: ReactorOpts) -> Result<SmpConfig> {
        if opts.overprovisioned {
            opts.idle_poll_time_us = Some(0);
            opts.thread_affinity = false;
            opts.poll_aio = false;
        }

        if opts.smp == Some(0) {
            return Err(FatalError::ZeroShards.into());
        }

        let cpuset = match &opts.cpuset {
            Some(expr) => {
                let cpus = parse_cpuset(expr)?;
                if cpus.is_empty() {
                    return Err(FatalError::BadCpuSet(expr.clone()).into());
                }
                cpus
            }
            None => (0..utils::thread::available_cpus()).collect(),
        };

        let shards = opts.smp.unwrap_or_else(|| cpuset.len());
        if shards > cpuset.len() && opts.cpuset.is_some() {
            return Err(FatalError::BadCpuSet(format!(
                "{} shards requested but cpuset has only {} CPUs",
                shards,
                cpuset.len()
            ))
            .into());
        }

        if opts.io_properties.is_some() && opts.io_properties_file.is_some() {
            return Err(FatalError::Boot(
                "both io-properties and io-properties-file specified; \
                 don't know which to trust"
                    .into(),
            )
            .into());
        }

        let memory = opts.memory.as_deref().map(parse_size).transpose()?;
        let reserve_memory = opts.reserve_memory.as_deref().map(parse_size).transpose()?;
        if let Some(requested) = memory {
            let available = physical_memory();
            if requested > available {
                return Err(FatalError::ImpossibleMemory {
                    requested,
                    available,
                }
                .into());
            }
        }

        let task_quota = Duration::from_secs_f64(opts.task_quota_ms / 1000.0);
        let task_quota = if task_quota.is_zero() {
            MIN_TASK_QUOTA
        } else {
            task_quota
        };

        let idle_poll_time_us = opts.idle_poll_time_us.unwrap_or_else(|| {
            if detected_virtualized() {
                DEFAULT_IDLE_POLL_TIME_VIRTUALIZED_US
            } else {
                DEFAULT_IDLE_POLL_TIME_US
            }
        });

        let reactor = ReactorConfig {
            task_quota,
            idle_poll_time: Duration::from_micros(idle_poll_time_us),
            poll_mode: opts.poll_mode,
            blocked_reactor_notify: Duration::from_millis(opts.blocked_reactor_notify_ms),
            blocked_reactor_reports_per_minute: opts.blocked_reactor_reports_per_minute,
            max_task_backlog: opts.max_task_backlog,
            poll_aio: opts.poll_aio,
            backend: opts.reactor_backend,
            auto_handle_sigint_sigterm: true,
            abort_on_alloc_failure: opts.abort_on_alloc_failure,
        };

        let num_io_groups = match opts.num_io_groups {
            Some(0) => {
                return Err(FatalError::Boot("num-io-groups must be greater than zero".into()).into())
            }
            Some(n) => n,
            None => shards,
        };

        Ok(SmpConfig {
            shards,
            cpuset,
            memory,
            reserve_memory,
            hugepages: opts.hugepages,
            lock_memory: opts.lock_memory,
            thread_affinity: opts.thread_affinity,
            shard0_memory_scale: opts.shard0_memory_scale,
            num_io_groups,
            io_properties_file: opts.io_properties_file,
            io_properties: opts.io_properties,
            reactor,
        })
    }
}

/// Parses a cpuset expression of the form "0-3,7,9-10".
pub fn parse_cpuset(expr: &str) -> Result<Vec<usize>, ParseError> {
    let mut cpus = Vec::new();
    let mut offset = 0;
    for part in expr.split(',') {
        let part_trimmed = part.trim();
        if part_trimmed.is_empty() {
            return Err(ParseError::new(ParseErrorKind::InvalidCpuSet, offset, expr));
        }
        let mut bounds = part_trimmed.splitn(2, '-');
        let lo: usize = bounds
            .next()
            .unwrap()
            .parse()
            .map_err(|_| ParseError::new(ParseErrorKind::InvalidCpuSet, offset, part_trimmed))?;
        let hi = match bounds.next() {
            Some(hi) => hi
                .parse()
                .map_err(|_| ParseError::new(ParseErrorKind::InvalidCpuSet, offset, part_trimmed))?,
            None => lo,
        };
        if hi < lo {
            return Err(ParseError::new(
                ParseErrorKind::InvalidCpuSet,
                offset,
                part_trimmed,
            ));
        }
        cpus.extend(lo..=hi);
        offset += part.len() + 1;
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

fn physical_memory() -> u64 {
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGESIZE);
        if pages <= 0 || page_size <= 0 {
            return u64::MAX;
        }
        pages as u64 * page_size as u64
    }
}

/// True when running under a hypervisor; sleep/wake transitions are far
/// more expensive there, so the idle-poll default is larger.
fn detected_virtualized() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/cpuinfo")
            .map(|s| s.lines().any(|l| l.starts_with("flags") && l.contains(" hypervisor")))
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn opts(args: &[&str]) -> ReactorOpts {
        ReactorOpts::parse_from(std::iter::once("percore").chain(args.iter().copied()))
    }

    #[test]
    fn zero_shards_rejected() {
        let err = SmpConfig::try_from(opts(&["--smp", "0"])).unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::ZeroShards)));
    }

    #[test]
    fn zero_task_quota_clamps_to_minimum() {
        let cfg = SmpConfig::try_from(opts(&["--task-quota-ms", "0"])).unwrap();
        assert_eq!(cfg.reactor.task_quota, MIN_TASK_QUOTA);
    }

    #[test]
    fn default_task_quota_is_half_a_millisecond() {
        let cfg = SmpConfig::default();
        assert_eq!(cfg.reactor.task_quota, Duration::from_micros(500));
    }

    #[test]
    fn overprovisioned_is_a_macro_flag() {
        let cfg = SmpConfig::try_from(opts(&["--overprovisioned"])).unwrap();
        assert_eq!(cfg.reactor.idle_poll_time, Duration::ZERO);
        assert!(!cfg.thread_affinity);
        assert!(!cfg.reactor.poll_aio);
    }

    #[test]
    fn conflicting_io_properties_sources_rejected() {
        let err = SmpConfig::try_from(opts(&[
            "--io-properties",
            "{}",
            "--io-properties-file",
            "/tmp/io.json",
        ]))
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn smp_larger_than_cpuset_rejected() {
        let err = SmpConfig::try_from(opts(&["--smp", "8", "--cpuset", "0-3"])).unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::BadCpuSet(_))));
    }

    #[rstest]
    #[case("0", vec![0])]
    #[case("0-3", vec![0, 1, 2, 3])]
    #[case("0-2,7", vec![0, 1, 2, 7])]
    #[case("3,1,1-2", vec![1, 2, 3])]
    fn cpuset_expressions(#[case] expr: &str, #[case] expected: Vec<usize>) {
        assert_eq!(parse_cpuset(expr).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("a-b")]
    #[case("3-1")]
    #[case("1,,2")]
    fn bad_cpuset_expressions(#[case] expr: &str) {
        assert!(parse_cpuset(expr).is_err());
    }

    #[test]
    fn impossible_memory_is_fatal() {
        // No machine this test runs on has 8 exbibytes of RAM.
        let err = SmpConfig::try_from(opts(&["--memory", "8388608T"])).unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::ImpossibleMemory { .. })));
    }
}
