//! Decode Scheduler
//!
//! Time-sliced decoding on the owner thread. Images about to be painted sit
//! in the ASAP queue, which is always drained before the normal queue.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::ImageId;
use crate::config::ImageConfig;
use crate::host::OwnerLoop;

/// Something the scheduler can feed bytes to
pub(crate) trait DecodeTarget {
    /// Decode in chunks of `max_bytes` until done or `deadline` passes
    ///
    /// Returns true if the target still has bytes to decode.
    fn decode_some(&self, max_bytes: usize, deadline: Instant) -> bool;
}

/// Which queue a request waits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePriority {
    /// Background decoding
    Normal,
    /// The image is about to be painted
    Asap,
}

/// Per-image bookkeeping
struct DecodeRequest {
    target: Weak<dyn DecodeTarget>,
    /// Goes to the ASAP queue when enqueued
    asap: bool,
    /// Time spent decoding since the request was created
    decode_time: Duration,
    /// Currently sitting in one of the queues
    queued: bool,
}

#[derive(Default)]
struct QueueState {
    asap: VecDeque<ImageId>,
    normal: VecDeque<ImageId>,
    requests: HashMap<ImageId, DecodeRequest>,
    /// A tick is posted on the host loop
    pending: bool,
}

impl QueueState {
    fn enqueue(&mut self, id: ImageId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.queued {
            return;
        }
        request.queued = true;
        if request.asap {
            self.asap.push_back(id);
        } else {
            self.normal.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<ImageId> {
        let id = self.asap.pop_front().or_else(|| self.normal.pop_front())?;
        if let Some(request) = self.requests.get_mut(&id) {
            request.queued = false;
        }
        Some(id)
    }

    fn unqueue(&mut self, id: ImageId) {
        self.asap.retain(|&queued| queued != id);
        self.normal.retain(|&queued| queued != id);
        if let Some(request) = self.requests.get_mut(&id) {
            request.queued = false;
        }
    }

    fn has_work(&self) -> bool {
        !self.asap.is_empty() || !self.normal.is_empty()
    }
}

/// Cooperative decode scheduler shared by all images of one service set
pub struct DecodeScheduler {
    state: RefCell<QueueState>,
    host: OwnerLoop,
    /// Bytes per decoder write
    max_bytes: usize,
    /// Budget of one tick
    max_tick: Duration,
    me: Weak<DecodeScheduler>,
}

impl DecodeScheduler {
    pub fn new(config: &ImageConfig, host: OwnerLoop) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            state: RefCell::new(QueueState::default()),
            host,
            max_bytes: config.decode_bytes_per_tick.max(1),
            max_tick: config.max_tick_duration(),
            me: me.clone(),
        })
    }

    pub fn max_bytes_per_chunk(&self) -> usize {
        self.max_bytes
    }

    /// Deadline for a slice of work starting now
    pub fn deadline_from_now(&self) -> Instant {
        Instant::now() + self.max_tick
    }

    /// Queue `target` and make sure a tick is coming
    pub(crate) fn request_decode(&self, id: ImageId, target: &Weak<dyn DecodeTarget>) {
        self.add_request(id, target);
        self.ensure_pending();
    }

    /// Queue `target` without arming a tick; no-op if already queued
    pub(crate) fn add_request(&self, id: ImageId, target: &Weak<dyn DecodeTarget>) {
        let mut state = self.state.borrow_mut();
        state.requests.entry(id).or_insert_with(|| DecodeRequest {
            target: target.clone(),
            asap: false,
            decode_time: Duration::ZERO,
            queued: false,
        });
        state.enqueue(id);
    }

    /// Promote an image about to be painted
    pub(crate) fn mark_as_asap(&self, id: ImageId, target: &Weak<dyn DecodeTarget>) {
        let mut state = self.state.borrow_mut();
        let request = state.requests.entry(id).or_insert_with(|| DecodeRequest {
            target: target.clone(),
            asap: false,
            decode_time: Duration::ZERO,
            queued: false,
        });
        if request.asap {
            return;
        }
        request.asap = true;

        if let Some(pos) = state.normal.iter().position(|&queued| queued == id) {
            state.normal.remove(pos);
            state.asap.push_back(id);
        }
    }

    /// Dequeue and reset the request of an image whose decoder went away
    pub fn stop_decoding(&self, id: ImageId) {
        let mut state = self.state.borrow_mut();
        state.unqueue(id);
        if let Some(request) = state.requests.get_mut(&id) {
            request.decode_time = Duration::ZERO;
            request.asap = false;
        }
    }

    /// Drop every trace of an image
    pub fn forget(&self, id: ImageId) {
        let mut state = self.state.borrow_mut();
        state.unqueue(id);
        state.requests.remove(&id);
    }

    pub fn record_decode_time(&self, id: ImageId, elapsed: Duration) {
        if let Some(request) = self.state.borrow_mut().requests.get_mut(&id) {
            request.decode_time += elapsed;
        }
    }

    pub fn decode_time(&self, id: ImageId) -> Duration {
        self.state
            .borrow()
            .requests
            .get(&id)
            .map_or(Duration::ZERO, |request| request.decode_time)
    }

    /// Queue an image currently waits in, if any
    pub fn queued_priority(&self, id: ImageId) -> Option<DecodePriority> {
        let state = self.state.borrow();
        if state.asap.contains(&id) {
            Some(DecodePriority::Asap)
        } else if state.normal.contains(&id) {
            Some(DecodePriority::Normal)
        } else {
            None
        }
    }

    fn ensure_pending(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.pending {
                return;
            }
            state.pending = true;
        }
        let me = self.me.clone();
        self.host.post(move || {
            if let Some(scheduler) = me.upgrade() {
                scheduler.tick();
            }
        });
    }

    /// Decode queued images until the tick budget runs out
    pub fn tick(&self) {
        self.state.borrow_mut().pending = false;
        let start = Instant::now();
        let deadline = start + self.max_tick;
        let mut served = 0usize;

        loop {
            let Some(id) = self.state.borrow_mut().pop() else {
                break;
            };
            let target = self.state.borrow().requests.get(&id).and_then(|r| r.target.upgrade());
            let Some(target) = target else {
                self.forget(id);
                continue;
            };

            let began = Instant::now();
            let more = target.decode_some(self.max_bytes, deadline);
            self.record_decode_time(id, began.elapsed());
            served += 1;

            if more {
                self.state.borrow_mut().enqueue(id);
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        tracing::trace!("decode tick served {} requests in {:?}", served, start.elapsed());

        if self.state.borrow().has_work() {
            self.ensure_pending();
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> DecodeQueueStats {
        let state = self.state.borrow();
        DecodeQueueStats {
            asap: state.asap.len(),
            normal: state.normal.len(),
            tracked: state.requests.len(),
            pending: state.pending,
        }
    }

    /// Check if both queues are empty
    pub fn is_empty(&self) -> bool {
        !self.state.borrow().has_work()
    }
}

impl std::fmt::Debug for DecodeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeScheduler")
            .field("stats", &self.stats())
            .field("max_bytes", &self.max_bytes)
            .field("max_tick", &self.max_tick)
            .finish()
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct DecodeQueueStats {
    pub asap: usize,
    pub normal: usize,
    pub tracked: usize,
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeTarget {
        id: ImageId,
        remaining: Cell<usize>,
        log: Rc<RefCell<Vec<ImageId>>>,
    }

    impl DecodeTarget for FakeTarget {
        fn decode_some(&self, _max_bytes: usize, _deadline: Instant) -> bool {
            self.log.borrow_mut().push(self.id);
            self.remaining.set(self.remaining.get().saturating_sub(1));
            self.remaining.get() > 0
        }
    }

    fn target(id: ImageId, chunks: usize, log: &Rc<RefCell<Vec<ImageId>>>) -> Rc<FakeTarget> {
        Rc::new(FakeTarget {
            id,
            remaining: Cell::new(chunks),
            log: log.clone(),
        })
    }

    fn weak(target: &Rc<FakeTarget>) -> Weak<dyn DecodeTarget> {
        let target: Rc<dyn DecodeTarget> = target.clone();
        Rc::downgrade(&target)
    }

    fn config(max_ms: u64) -> ImageConfig {
        ImageConfig {
            max_ms_per_tick: max_ms,
            ..ImageConfig::default()
        }
    }

    #[test]
    fn test_asap_drained_first() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(10_000), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        let a = target(1, 1, &log);
        let b = target(2, 1, &log);
        let c = target(3, 1, &log);

        scheduler.request_decode(1, &weak(&a));
        scheduler.request_decode(2, &weak(&b));
        scheduler.request_decode(3, &weak(&c));
        scheduler.mark_as_asap(3, &weak(&c));
        scheduler.mark_as_asap(2, &weak(&b));

        assert_eq!(scheduler.queued_priority(1), Some(DecodePriority::Normal));
        assert_eq!(scheduler.queued_priority(3), Some(DecodePriority::Asap));

        host.run_pending();
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_duplicate_request_ignored() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(10_000), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = target(1, 1, &log);

        scheduler.request_decode(1, &weak(&a));
        scheduler.request_decode(1, &weak(&a));
        assert_eq!(scheduler.stats().normal, 1);

        host.run_pending();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_unfinished_requeued_at_tail() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(10_000), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = target(1, 2, &log);
        let b = target(2, 1, &log);

        scheduler.request_decode(1, &weak(&a));
        scheduler.request_decode(2, &weak(&b));
        host.run_pending();

        assert_eq!(*log.borrow(), vec![1, 2, 1]);
    }

    #[test]
    fn test_tick_yields_and_rearms() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(0), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = target(1, 3, &log);

        scheduler.request_decode(1, &weak(&a));
        assert!(scheduler.stats().pending);

        // One chunk per tick with a zero budget
        assert!(host.run_once());
        assert_eq!(log.borrow().len(), 1);
        assert!(scheduler.stats().pending);

        host.run_pending();
        assert_eq!(log.borrow().len(), 3);
        assert!(!scheduler.stats().pending);
    }

    #[test]
    fn test_stop_decoding_resets() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(10_000), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = target(1, 1, &log);

        scheduler.request_decode(1, &weak(&a));
        scheduler.mark_as_asap(1, &weak(&a));
        scheduler.record_decode_time(1, Duration::from_millis(5));
        scheduler.stop_decoding(1);

        assert_eq!(scheduler.queued_priority(1), None);
        assert_eq!(scheduler.decode_time(1), Duration::ZERO);

        host.run_pending();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_dropped_target_forgotten() {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config(10_000), host.clone());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = target(1, 1, &log);

        scheduler.request_decode(1, &weak(&a));
        drop(a);
        host.run_pending();

        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.stats().tracked, 0);
    }
}
