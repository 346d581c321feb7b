//! percore: a shard-per-core cooperative reactor runtime.
//!
//! One reactor per pinned OS thread, weighted-fair task queues, three
//! timer wheels, lock-free cross-shard message queues, cooperative
//! preemption and a CPU-time stall detector. Kernel I/O backends are
//! injected behind the [`reactor::Backend`] trait.

pub mod config;
pub mod error;
pub mod future;
pub mod io;
pub mod reactor;
pub mod sched;
pub mod shard;
pub mod smp;
pub mod sync;
pub mod timer;

pub(crate) mod syscall;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ReactorOpts, SmpConfig};
pub use error::{Error, Result};
pub use future::{channel, Future, Promise};
pub use reactor::{need_preempt, Backend, PollFn, Reactor, SleepNotifier};
pub use sched::{current_scheduling_group, SchedulingGroup, Task};
pub use shard::{this_shard_id, ShardId};
pub use smp::{invoke_on_all, submit_to, ShardManager, ShardState, SmpQueueStats, SmpServiceGroup};
pub use sync::Semaphore;
pub use timer::{ClockSource, Timer};
pub use utils::parse_size;
