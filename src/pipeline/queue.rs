use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::Priority;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: Priority,
    seq: u64,
    job_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of job ids, FIFO within a priority.
#[derive(Default)]
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job; false once the queue is closed.
    pub fn push(&self, job_id: Uuid, priority: Priority) -> bool {
        if self.is_closed() {
            return false;
        }
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(Entry { priority, seq, job_id });
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<Uuid> {
        self.heap.lock().pop().map(|e| e.job_id)
    }

    /// Waits for the next job; `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Uuid> {
        loop {
            // Created before the closed check so a concurrent close still wakes it.
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(job_id) = self.try_pop() {
                return Some(job_id);
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}
