use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::sched::{SchedulingGroup, Task};

/// A named, weighted FIFO of tasks.
///
/// `vruntime` is the runtime consumed so far scaled by `2^32 / shares`;
/// the reactor always runs the active queue with the smallest vruntime,
/// which is what makes the scheduler weighted-fair.
pub(crate) struct TaskQueue {
    pub(crate) id: SchedulingGroup,
    pub(crate) name: String,
    shares: f32,
    reciprocal_shares_times_2_power_32: u64,
    pub(crate) vruntime: u64,
    pub(crate) active: bool,
    pub(crate) current: bool,
    /// Timestamp of the last activation or run completion.
    pub(crate) ts: Instant,
    pub(crate) runtime: Duration,
    pub(crate) waittime: Duration,
    pub(crate) starvetime: Duration,
    pub(crate) tasks_processed: u64,
    /// Sum of batch runtime beyond one quota, for batches over twice the quota.
    pub(crate) time_spent_on_task_quota_violations: Duration,
    pub(crate) q: VecDeque<Task>,
}

impl TaskQueue {
    pub(crate) fn new(id: SchedulingGroup, name: impl Into<String>, shares: f32) -> TaskQueue {
        let mut tq = TaskQueue {
            id,
            name: name.into(),
            shares: 1.0,
            reciprocal_shares_times_2_power_32: 1 << 32,
            vruntime: 0,
            active: false,
            current: false,
            ts: Instant::now(),
            runtime: Duration::ZERO,
            waittime: Duration::ZERO,
            starvetime: Duration::ZERO,
            tasks_processed: 0,
            time_spent_on_task_quota_violations: Duration::ZERO,
            q: VecDeque::new(),
        };
        tq.set_shares(shares);
        tq
    }

    /// Shares below 1.0 are clamped; a zero-share queue still makes progress.
    pub(crate) fn set_shares(&mut self, shares: f32) {
        self.shares = shares.max(1.0);
        self.reciprocal_shares_times_2_power_32 =
            ((1u64 << 32) as f64 / self.shares as f64) as u64;
    }

    pub(crate) fn shares(&self) -> f32 {
        self.shares
    }

    pub(crate) fn to_vruntime(&self, runtime: Duration) -> u64 {
        let scaled = (runtime.as_nanos() * self.reciprocal_shares_times_2_power_32 as u128) >> 32;
        scaled as u64
    }

    /// Charges one dispatch batch to the queue.
    pub(crate) fn account_runtime(&mut self, delta: Duration, task_quota: Duration) {
        if delta > task_quota * 2 {
            self.time_spent_on_task_quota_violations += delta - task_quota;
        }
        self.runtime += delta;
        self.vruntime += self.to_vruntime(delta);
    }
}

/// Entry in the reactor's active set. Ordered ascending by vruntime with
/// insertion order (`seq`) breaking ties, inverted so it works with
/// `std::collections::BinaryHeap`'s max-heap.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ActiveEntry {
    pub(crate) vruntime: u64,
    pub(crate) seq: u64,
    pub(crate) group: SchedulingGroup,
}

impl Ord for ActiveEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.vruntime, other.seq).cmp(&(self.vruntime, self.seq))
    }
}

impl PartialOrd for ActiveEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BinaryHeap;

    #[test]
    fn zero_shares_clamped_to_one() {
        let tq = TaskQueue::new(SchedulingGroup(2), "zero", 0.0);
        assert_eq!(tq.shares(), 1.0);
    }

    #[rstest]
    #[case(1.0, 1_000, 1_000)]
    #[case(2.0, 1_000, 500)]
    #[case(4.0, 1_000, 250)]
    #[case(1000.0, 1_000_000, 1_000)]
    fn vruntime_scales_inversely_with_shares(
        #[case] shares: f32,
        #[case] runtime_ns: u64,
        #[case] expected: u64,
    ) {
        let tq = TaskQueue::new(SchedulingGroup(2), "scaled", shares);
        let v = tq.to_vruntime(Duration::from_nanos(runtime_ns));
        // Reciprocal rounding may lose at most one unit.
        assert!(v.abs_diff(expected) <= 1, "got {v}, expected {expected}");
    }

    #[test]
    fn vruntime_is_monotonic() {
        let mut tq = TaskQueue::new(SchedulingGroup(2), "mono", 3.0);
        let quota = Duration::from_micros(500);
        let mut last = 0;
        for delta_us in [10u64, 500, 90, 2000, 1] {
            tq.account_runtime(Duration::from_micros(delta_us), quota);
            assert!(tq.vruntime >= last);
            last = tq.vruntime;
        }
    }

    #[test]
    fn quota_violation_credits_excess_over_one_quota() {
        let mut tq = TaskQueue::new(SchedulingGroup(2), "violator", 1.0);
        let quota = Duration::from_micros(500);

        // Within twice the quota: no violation recorded.
        tq.account_runtime(Duration::from_micros(900), quota);
        assert_eq!(tq.time_spent_on_task_quota_violations, Duration::ZERO);

        // A 2.5ms batch against a 0.5ms quota credits 2.0ms.
        tq.account_runtime(Duration::from_micros(2500), quota);
        assert_eq!(
            tq.time_spent_on_task_quota_violations,
            Duration::from_micros(2000)
        );
    }

    #[test]
    fn active_entries_pop_smallest_vruntime_first() {
        let mut heap = BinaryHeap::new();
        heap.push(ActiveEntry { vruntime: 30, seq: 0, group: SchedulingGroup(0) });
        heap.push(ActiveEntry { vruntime: 10, seq: 1, group: SchedulingGroup(1) });
        heap.push(ActiveEntry { vruntime: 20, seq: 2, group: SchedulingGroup(2) });

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.vruntime)).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn active_entry_ties_break_by_insertion_order() {
        let mut heap = BinaryHeap::new();
        heap.push(ActiveEntry { vruntime: 7, seq: 4, group: SchedulingGroup(4) });
        heap.push(ActiveEntry { vruntime: 7, seq: 2, group: SchedulingGroup(2) });
        heap.push(ActiveEntry { vruntime: 7, seq: 3, group: SchedulingGroup(3) });

        let order: Vec<u16> = std::iter::from_fn(|| heap.pop().map(|e| e.group.0)).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }
}
