//! Discard Tracker
//!
//! Time-ordered registry of images whose decoded frames may be dropped.
//! Touching an image moves it to the back; a sweep discards from the front
//! until it meets an image that has not been idle long enough.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Weak;
use std::time::{Duration, Instant};

use crate::ImageId;
use crate::config::ImageConfig;

/// Something that can give up its decoded frames
pub(crate) trait DiscardTarget {
    /// Called after the tracker dropped the node for having expired
    fn discard_expired(&self);
}

/// Queue position of one touch; stale once the image is touched again or removed
struct TrackerNode {
    id: ImageId,
    stamp: u64,
    /// Last touch
    touched: Instant,
}

struct TrackerEntry {
    stamp: u64,
    target: Weak<dyn DiscardTarget>,
}

#[derive(Default)]
struct TrackerList {
    order: VecDeque<TrackerNode>,
    live: HashMap<ImageId, TrackerEntry>,
    next_stamp: u64,
}

impl TrackerList {
    fn is_live(&self, node: &TrackerNode) -> bool {
        self.live.get(&node.id).is_some_and(|entry| entry.stamp == node.stamp)
    }

    /// Oldest live node, dropping stale ones in front of it
    fn front(&mut self) -> Option<&TrackerNode> {
        while let Some(node) = self.order.front() {
            if self.is_live(node) {
                break;
            }
            self.order.pop_front();
        }
        self.order.front()
    }

    fn compact(&mut self) {
        if self.order.len() > 2 * self.live.len() + 16 {
            let live = &self.live;
            self.order
                .retain(|node| live.get(&node.id).is_some_and(|entry| entry.stamp == node.stamp));
        }
    }
}

/// Registry of discardable images, oldest first
pub struct DiscardTracker {
    nodes: RefCell<TrackerList>,
    /// Global discarding switch
    enabled: bool,
    /// Idle time before an image is discarded
    timeout: Duration,
    /// Images discarded by sweeps
    discarded: Cell<u64>,
}

impl DiscardTracker {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            nodes: RefCell::new(TrackerList::default()),
            enabled: config.discarding_enabled,
            timeout: config.discard_timeout(),
            discarded: Cell::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Touch an image now
    pub(crate) fn reset(&self, id: ImageId, target: &Weak<dyn DiscardTarget>) {
        self.reset_at(id, target, Instant::now());
    }

    /// Touch an image at `now`; stamps must not go backwards
    pub(crate) fn reset_at(&self, id: ImageId, target: &Weak<dyn DiscardTarget>, now: Instant) {
        let mut nodes = self.nodes.borrow_mut();
        let stamp = nodes.next_stamp;
        nodes.next_stamp += 1;
        nodes.live.insert(
            id,
            TrackerEntry {
                stamp,
                target: target.clone(),
            },
        );
        nodes.order.push_back(TrackerNode {
            id,
            stamp,
            touched: now,
        });
        nodes.compact();
    }

    /// Drop membership without discarding anything
    pub fn remove(&self, id: ImageId) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let removed = nodes.live.remove(&id).is_some();
        if removed {
            nodes.compact();
        }
        removed
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.nodes.borrow().live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().live.is_empty()
    }

    /// When the oldest node expires, for arming the host timer
    pub fn next_expiry(&self) -> Option<Instant> {
        self.nodes
            .borrow_mut()
            .front()
            .map(|node| node.touched + self.timeout)
    }

    /// Discard every image idle longer than the timeout
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweep as of `now`; returns the number of images discarded
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut count = 0;
        loop {
            let target = {
                let mut nodes = self.nodes.borrow_mut();
                let expired = match nodes.front() {
                    Some(front) if now.saturating_duration_since(front.touched) >= self.timeout => Some(front.id),
                    _ => None,
                };
                expired.and_then(|id| {
                    nodes.order.pop_front();
                    nodes.live.remove(&id).map(|entry| entry.target)
                })
            };
            let Some(target) = target else {
                break;
            };
            // The borrow is released; the image may touch or remove itself
            if let Some(target) = target.upgrade() {
                target.discard_expired();
                count += 1;
            }
        }
        if count > 0 {
            self.discarded.set(self.discarded.get() + count as u64);
            tracing::debug!("discard sweep released {} images", count);
        }
        count
    }

    pub fn stats(&self) -> DiscardStats {
        DiscardStats {
            tracked: self.len(),
            discarded: self.discarded.get(),
        }
    }
}

impl std::fmt::Debug for DiscardTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscardTracker")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Tracker statistics
#[derive(Debug, Clone)]
pub struct DiscardStats {
    pub tracked: usize,
    pub discarded: u64,
}
