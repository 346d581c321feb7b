use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::ArrayQueue;

use crate::error::Error;
use crate::future::{channel, Future, Promise};
use crate::shard::ShardId;
use crate::smp::{ShardCtl, SmpServiceGroup};
use crate::sync::Semaphore;
use crate::utils::prefetch_read;

/// Capacity of one cross-shard SPSC ring.
pub(crate) const QUEUE_LENGTH: usize = 128;

/// Producers batch at least this many items in a thread-local fifo before
/// touching the shared ring, to amortize cross-cache traffic.
pub(crate) const BATCH_SIZE: usize = 16;

/// How far ahead the consumer prefetches while draining a batch.
const PREFETCH_AHEAD: usize = 2;

/// A unit of cross-shard work. `process` runs on the destination shard
/// and hands the item back for the completion ring; `complete` and `fail`
/// run on the originating shard and resolve the submitter's future.
pub(crate) trait WorkItem: Send {
    fn process(self: Box<Self>) -> Box<dyn WorkItem>;
    fn complete(self: Box<Self>);
    fn fail(self: Box<Self>, err: Error);
    fn service_group(&self) -> SmpServiceGroup;
}

struct AsyncWorkItem<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    func: Option<F>,
    result: Option<std::thread::Result<T>>,
    /// Only touched by `complete`/`fail`, which run on the origin shard.
    promise: Option<Promise<T>>,
    ssg: SmpServiceGroup,
}

// Safety: the item as a whole travels between two statically-known
// shards, but the non-Send promise half is only ever dereferenced on the
// shard that created it; `process` on the remote side touches `func` and
// `result` exclusively.
unsafe impl<F, T> Send for AsyncWorkItem<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
}

impl<F, T> WorkItem for AsyncWorkItem<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn process(mut self: Box<Self>) -> Box<dyn WorkItem> {
        let func = self.func.take().expect("work item processed twice");
        self.result = Some(catch_unwind(AssertUnwindSafe(func)));
        self
    }

    fn complete(mut self: Box<Self>) {
        let promise = self.promise.take().expect("work item completed twice");
        match self.result.take() {
            Some(Ok(value)) => promise.set_value(value),
            Some(Err(panic)) => promise.set_error(Error::RemotePanic(panic_message(&panic))),
            None => promise.set_error(Error::AllRequestsFailed),
        }
    }

    fn fail(mut self: Box<Self>, err: Error) {
        let promise = self.promise.take().expect("work item completed twice");
        promise.set_error(err);
    }

    fn service_group(&self) -> SmpServiceGroup {
        self.ssg
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counters for one cross-shard channel, exported per ordered shard pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmpQueueStats {
    pub sent: u64,
    pub completed: u64,
    pub received: u64,
    pub last_send_batch: u64,
    pub last_completion_batch: u64,
    pub last_receive_batch: u64,
    pub queue_length: u64,
}

/// The two rings shared by one ordered shard pair: `pending` carries work
/// from source to destination, `completed` carries finished items back.
pub(crate) struct ChannelCore {
    pending: ArrayQueue<Box<dyn WorkItem>>,
    completed: ArrayQueue<Box<dyn WorkItem>>,
}

impl ChannelCore {
    pub(crate) fn new() -> Arc<ChannelCore> {
        Arc::new(ChannelCore {
            pending: ArrayQueue::new(QUEUE_LENGTH),
            completed: ArrayQueue::new(QUEUE_LENGTH),
        })
    }
}

/// Source-shard end of one cross-shard channel.
pub(crate) struct PeerSender {
    pub(crate) to: ShardId,
    core: Arc<ChannelCore>,
    dest: Arc<ShardCtl>,
    pending_fifo: RefCell<Vec<Box<dyn WorkItem>>>,
    service_semaphores: RefCell<Vec<Semaphore>>,
    sent: Cell<u64>,
    completed: Cell<u64>,
    last_snt_batch: Cell<u64>,
    last_cmpl_batch: Cell<u64>,
    current_queue_length: Cell<u64>,
}

impl PeerSender {
    pub(crate) fn new(to: ShardId, core: Arc<ChannelCore>, dest: Arc<ShardCtl>) -> Rc<PeerSender> {
        Rc::new(PeerSender {
            to,
            core,
            dest,
            pending_fifo: RefCell::new(Vec::new()),
            service_semaphores: RefCell::new(Vec::new()),
            sent: Cell::new(0),
            completed: Cell::new(0),
            last_snt_batch: Cell::new(0),
            last_cmpl_batch: Cell::new(0),
            current_queue_length: Cell::new(0),
        })
    }

    /// Submits `func` to run on the destination shard. One unit of the
    /// service group's semaphore is held until the completion comes back;
    /// if the semaphore wait runs past `deadline` the item fails locally
    /// and nothing is enqueued.
    pub(crate) fn submit<T, F>(
        self: &Rc<Self>,
        ssg: SmpServiceGroup,
        deadline: Option<Instant>,
        func: F,
    ) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (promise, future) = channel();
        if self.dest.is_stopped() {
            promise.set_error(Error::RequestReceiverDown);
            return future;
        }
        let item = Box::new(AsyncWorkItem {
            func: Some(func),
            result: None,
            promise: Some(promise),
            ssg,
        });

        let this = self.clone();
        self.semaphore(ssg)
            .wait_until(1, deadline)
            .then_wrapped(move |r| {
                let item: Box<dyn WorkItem> = item;
                match r {
                    Ok(()) => this.enqueue(item),
                    Err(e) => item.fail(e),
                }
                Ok(())
            })
            .handle(|r| {
                let _ = r;
            });
        future
    }

    fn enqueue(&self, item: Box<dyn WorkItem + 'static>) {
        let mut fifo = self.pending_fifo.borrow_mut();
        fifo.push(item);
        if fifo.len() >= BATCH_SIZE {
            drop(fifo);
            self.move_pending();
        }
    }

    /// Bulk-pushes the thread-local fifo into the shared ring.
    pub(crate) fn move_pending(&self) {
        let mut fifo = self.pending_fifo.borrow_mut();
        if fifo.is_empty() {
            return;
        }
        let mut moved = 0u64;
        let mut rest = Vec::new();
        for item in fifo.drain(..) {
            // Once one push hits a full ring, keep the remainder in order.
            if !rest.is_empty() {
                rest.push(item);
                continue;
            }
            match self.core.pending.push(item) {
                Ok(()) => moved += 1,
                Err(item) => rest.push(item),
            }
        }
        *fifo = rest;
        if moved > 0 {
            self.sent.set(self.sent.get() + moved);
            self.last_snt_batch.set(moved);
            self.current_queue_length
                .set(self.current_queue_length.get() + moved);
            self.dest.notifier.maybe_notify();
        }
    }

    pub(crate) fn flush_request_batch(&self) -> bool {
        let had = !self.pending_fifo.borrow().is_empty();
        if had {
            self.move_pending();
        }
        had
    }

    /// Drains completion messages, resolving futures and releasing
    /// service-group semaphore units.
    pub(crate) fn process_completions(&self) -> usize {
        let mut n = 0usize;
        while let Some(item) = self.core.completed.pop() {
            let ssg = item.service_group();
            item.complete();
            self.semaphore(ssg).signal(1);
            n += 1;
        }
        if n > 0 {
            self.completed.set(self.completed.get() + n as u64);
            self.last_cmpl_batch.set(n as u64);
            self.current_queue_length
                .set(self.current_queue_length.get().saturating_sub(n as u64));
        }
        n
    }

    pub(crate) fn pure_poll_tx(&self) -> bool {
        !self.core.completed.is_empty()
    }

    /// Fails semaphore waiters whose deadlines elapsed.
    pub(crate) fn reap_expired(&self, now: Instant) {
        for sem in self.service_semaphores.borrow().iter() {
            sem.reap_expired(now);
        }
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent.get()
    }

    pub(crate) fn stats(&self) -> SmpQueueStats {
        SmpQueueStats {
            sent: self.sent.get(),
            completed: self.completed.get(),
            last_send_batch: self.last_snt_batch.get(),
            last_completion_batch: self.last_cmpl_batch.get(),
            queue_length: self.current_queue_length.get(),
            ..SmpQueueStats::default()
        }
    }

    fn semaphore(&self, ssg: SmpServiceGroup) -> Semaphore {
        let mut sems = self.service_semaphores.borrow_mut();
        while sems.len() <= ssg.0 {
            let limit = crate::smp::service_group_limit(SmpServiceGroup(sems.len()));
            sems.push(Semaphore::new(limit));
        }
        sems[ssg.0].clone()
    }
}

/// Destination-shard end of one cross-shard channel.
pub(crate) struct PeerReceiver {
    pub(crate) from: ShardId,
    core: Arc<ChannelCore>,
    src: Arc<ShardCtl>,
    completed_fifo: RefCell<Vec<Box<dyn WorkItem>>>,
    received: Cell<u64>,
    last_rcv_batch: Cell<u64>,
}

impl PeerReceiver {
    pub(crate) fn new(
        from: ShardId,
        core: Arc<ChannelCore>,
        src: Arc<ShardCtl>,
    ) -> Rc<PeerReceiver> {
        Rc::new(PeerReceiver {
            from,
            core,
            src,
            completed_fifo: RefCell::new(Vec::new()),
            received: Cell::new(0),
            last_rcv_batch: Cell::new(0),
        })
    }

    /// Drains incoming work items, running each on this shard. The batch
    /// is copied to local memory first so the time spent touching
    /// cross-cpu cache lines is minimized.
    pub(crate) fn process_incoming(&self) -> usize {
        let mut batch: Vec<Box<dyn WorkItem>> = Vec::new();
        while batch.len() < QUEUE_LENGTH {
            match self.core.pending.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        if batch.is_empty() {
            return 0;
        }

        let n = batch.len();
        for i in 0..n {
            if i + PREFETCH_AHEAD < n {
                prefetch_read(&*batch[i + PREFETCH_AHEAD] as *const dyn WorkItem as *const u8);
            }
            // Indexed remove keeps the prefetch window stable.
            let item = std::mem::replace(&mut batch[i], Box::new(NopItem));
            let done = item.process();
            self.respond(done);
        }

        self.received.set(self.received.get() + n as u64);
        self.last_rcv_batch.set(n as u64);
        n
    }

    fn respond(&self, item: Box<dyn WorkItem>) {
        let mut fifo = self.completed_fifo.borrow_mut();
        fifo.push(item);
        if fifo.len() >= BATCH_SIZE {
            drop(fifo);
            self.flush_response_batch();
        }
    }

    pub(crate) fn flush_response_batch(&self) -> bool {
        let mut fifo = self.completed_fifo.borrow_mut();
        if fifo.is_empty() {
            return false;
        }
        let mut moved = 0;
        let mut rest = Vec::new();
        for item in fifo.drain(..) {
            if !rest.is_empty() {
                rest.push(item);
                continue;
            }
            match self.core.completed.push(item) {
                Ok(()) => moved += 1,
                Err(item) => rest.push(item),
            }
        }
        *fifo = rest;
        if moved > 0 {
            self.src.notifier.maybe_notify();
        }
        moved > 0
    }

    pub(crate) fn pure_poll_rx(&self) -> bool {
        !self.core.pending.is_empty()
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.get()
    }

    pub(crate) fn stats(&self) -> SmpQueueStats {
        SmpQueueStats {
            received: self.received.get(),
            last_receive_batch: self.last_rcv_batch.get(),
            ..SmpQueueStats::default()
        }
    }
}

/// Placeholder swapped into the drained batch; never enqueued.
struct NopItem;

impl WorkItem for NopItem {
    fn process(self: Box<Self>) -> Box<dyn WorkItem> {
        self
    }

    fn complete(self: Box<Self>) {}

    fn fail(self: Box<Self>, _err: Error) {}

    fn service_group(&self) -> SmpServiceGroup {
        SmpServiceGroup(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::DEFAULT_SMP_SERVICE_GROUP;
    use std::sync::Mutex;

    fn pair() -> (Rc<PeerSender>, Rc<PeerReceiver>) {
        let core = ChannelCore::new();
        let src = ShardCtl::new(0).unwrap();
        let dst = ShardCtl::new(1).unwrap();
        (
            PeerSender::new(1, core.clone(), dst),
            PeerReceiver::new(0, core, src),
        )
    }

    #[test]
    fn items_flow_in_submission_order() {
        let (tx, rx) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let seen = seen.clone();
            tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, move || {
                seen.lock().unwrap().push(i);
            })
            .handle(|r| r.unwrap());
        }
        tx.flush_request_batch();

        // 100 items through a 128-slot ring in one go.
        let mut processed = 0;
        while processed < 100 {
            let n = rx.process_incoming();
            assert!(n > 0, "ring drained early at {processed}");
            processed += n;
        }
        rx.flush_response_batch();
        tx.process_completions();

        assert_eq!(tx.sent(), 100);
        assert_eq!(rx.received(), 100);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order");
    }

    #[test]
    fn batches_below_threshold_need_explicit_flush() {
        let (tx, rx) = pair();
        for _ in 0..BATCH_SIZE - 1 {
            tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, || {}).handle(|r| r.unwrap());
        }
        assert_eq!(rx.process_incoming(), 0, "still in the pending fifo");

        assert!(tx.flush_request_batch());
        assert_eq!(rx.process_incoming(), BATCH_SIZE - 1);
    }

    #[test]
    fn reaching_batch_size_flushes_automatically() {
        let (tx, rx) = pair();
        for _ in 0..BATCH_SIZE {
            tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, || {}).handle(|r| r.unwrap());
        }
        assert_eq!(rx.process_incoming(), BATCH_SIZE);
    }

    #[test]
    fn completion_resolves_with_payload_bits_intact() {
        let (tx, rx) = pair();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, || 0xdead_beef_cafe_f00du64)
            .handle(move |r| *got2.lock().unwrap() = Some(r.unwrap()));
        tx.flush_request_batch();
        rx.process_incoming();
        rx.flush_response_batch();
        tx.process_completions();
        assert_eq!(*got.lock().unwrap(), Some(0xdead_beef_cafe_f00d));
    }

    #[test]
    fn remote_panic_is_marshaled_back() {
        let (tx, rx) = pair();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        tx.submit::<(), _>(DEFAULT_SMP_SERVICE_GROUP, None, || panic!("boom on shard 1"))
            .handle(move |r| {
                *got2.lock().unwrap() = Some(match r {
                    Err(Error::RemotePanic(msg)) => msg,
                    other => panic!("unexpected {other:?}"),
                })
            });
        tx.flush_request_batch();
        rx.process_incoming();
        rx.flush_response_batch();
        tx.process_completions();
        assert_eq!(got.lock().unwrap().as_deref(), Some("boom on shard 1"));
    }

    #[test]
    fn deadline_elapsed_fails_locally() {
        let (tx, rx) = pair();
        // Exhaust the service-group semaphore so the next submit waits.
        let limit = crate::smp::service_group_limit(DEFAULT_SMP_SERVICE_GROUP);
        assert!(tx.semaphore(DEFAULT_SMP_SERVICE_GROUP).try_wait(limit));

        let now = Instant::now();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        tx.submit(DEFAULT_SMP_SERVICE_GROUP, Some(now), move || 1u32)
            .handle(move |r| {
                *outcome2.lock().unwrap() = Some(matches!(r, Err(Error::DeadlineExceeded)));
            });

        tx.reap_expired(now + std::time::Duration::from_millis(1));
        assert_eq!(*outcome.lock().unwrap(), Some(true));

        // Nothing was enqueued.
        tx.flush_request_batch();
        assert_eq!(rx.process_incoming(), 0);
    }

    #[test]
    fn submissions_to_a_stopped_shard_fail() {
        let core = ChannelCore::new();
        let src = ShardCtl::new(0).unwrap();
        let dst = ShardCtl::new(1).unwrap();
        let tx = PeerSender::new(1, core.clone(), dst.clone());
        let rx = PeerReceiver::new(0, core, src);

        dst.set_stopped();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, || 1u32)
            .handle(move |r| {
                *outcome2.lock().unwrap() =
                    Some(matches!(r, Err(Error::RequestReceiverDown)));
            });
        assert_eq!(*outcome.lock().unwrap(), Some(true));

        tx.flush_request_batch();
        assert_eq!(rx.process_incoming(), 0, "nothing may be enqueued");
    }

    #[test]
    fn ring_overflow_keeps_items_in_the_fifo() {
        let (tx, rx) = pair();
        // More than the ring can take in one push.
        for _ in 0..QUEUE_LENGTH + 40 {
            tx.submit(DEFAULT_SMP_SERVICE_GROUP, None, || {}).handle(|r| r.unwrap());
        }
        tx.flush_request_batch();

        let first = rx.process_incoming();
        assert_eq!(first, QUEUE_LENGTH);

        // The overflow lands on the next flush.
        tx.flush_request_batch();
        assert_eq!(rx.process_incoming(), 40);
    }
}
