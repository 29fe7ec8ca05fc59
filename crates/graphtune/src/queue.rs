//! Mutex-guarded bounded FIFO queues shared between pipeline stages.

use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// A bounded FIFO. Producers never block: pushing into a full queue drops
/// the value and reports the overflow to the caller.
pub struct ResultQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Default for ResultQueue<T> {
    fn default() -> Self {
        ResultQueue::new()
    }
}

impl<T> ResultQueue<T> {
    pub fn new() -> Self {
        ResultQueue::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ResultQueue {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends `value`; returns `false` (dropping the value) when full.
    pub fn push(&self, value: T) -> bool {
        let mut items = self.items.lock().expect("result queue poisoned");
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(value);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().expect("result queue poisoned").pop_front()
    }

    /// Replaces the whole queue content with `value`. Used for the singleton
    /// best-function queues.
    pub fn replace(&self, value: T) {
        let mut items = self.items.lock().expect("result queue poisoned");
        items.clear();
        items.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("result queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("result queue poisoned").is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().expect("result queue poisoned").clear();
    }
}

impl<T: Clone> ResultQueue<T> {
    /// Clones the head without removing it. The emergency queues rely on
    /// peek-then-pop: a key stays queued until its rescue attempt succeeds.
    pub fn peek(&self) -> Option<T> {
        self.items
            .lock()
            .expect("result queue poisoned")
            .front()
            .cloned()
    }
}
