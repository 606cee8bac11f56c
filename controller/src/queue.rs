//! Per-org event queues and the registry the dispatcher routes through.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use blockhost_types::{Event, OrgId};
use parking_lot::Mutex;

/// Ordered buffer of pending events for one org. The dispatcher appends,
/// the org's worker drains FIFO.
#[derive(Debug, Default)]
pub struct OrgQueue {
    events: Mutex<VecDeque<Event>>,
}

impl OrgQueue {
    pub fn pop(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    fn push(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Registry of live per-org queues.
///
/// Workers terminate when their queue runs dry, so publishing races against
/// a worker draining the last event and retiring. The registry lock is the
/// single point of synchronisation: [`publish`](Self::publish) pushes while
/// holding it, and [`try_retire`](Self::try_retire) re-checks emptiness
/// under it before removing the org. Either the retiring worker sees the
/// fresh event and keeps going, or it is already gone and the publisher is
/// told to spawn a replacement.
#[derive(Debug, Default)]
pub struct QueueMap {
    queues: Mutex<HashMap<OrgId, Arc<OrgQueue>>>,
}

impl QueueMap {
    /// Append an event to its org's queue, creating the queue if the org has
    /// no live worker. Returns the queue handle iff a worker must be spawned
    /// for it.
    pub fn publish(&self, event: Event) -> Option<Arc<OrgQueue>> {
        let org = event.org;
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&org) {
            queue.push(event);
            return None;
        }
        let queue = Arc::new(OrgQueue::default());
        queue.push(event);
        queues.insert(org, Arc::clone(&queue));
        Some(queue)
    }

    /// Worker exit protocol: with the registry locked, confirm the queue is
    /// still empty, remove the org and allow the exit. A publish that won the
    /// lock first makes this return `false`; the worker keeps draining.
    pub fn try_retire(&self, org: &OrgId, queue: &OrgQueue) -> bool {
        let mut queues = self.queues.lock();
        if queue.is_empty() {
            queues.remove(org);
            true
        } else {
            false
        }
    }

    pub fn live_orgs(&self) -> usize {
        self.queues.lock().len()
    }
}
