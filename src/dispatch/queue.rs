//! Bounded FIFO shared by every pump and worker

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Bounded queue with non-blocking and waiting variants of push and pop
///
/// The lock is only held for single deque operations, never across an
/// await, so each operation is one atomic step between suspension points.
pub(crate) struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append unless full; hands the item back when there is no room
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append, waiting for room
    pub async fn push(&self, mut item: T) {
        loop {
            let room = self.not_full.notified();
            match self.try_push(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            room.await;
        }
    }

    /// Remove the oldest item, if any
    pub fn pop_front(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove the oldest item, waiting for one to arrive
    pub async fn pop(&self) -> T {
        loop {
            let ready = self.not_empty.notified();
            if let Some(item) = self.pop_front() {
                return item;
            }
            ready.await;
        }
    }

    /// Discard everything queued, returning how many items were dropped
    pub fn drain(&self) -> usize {
        let drained = {
            let mut items = self.lock();
            let n = items.len();
            items.clear();
            n
        };
        if drained > 0 {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run `f` against the queued items, oldest first
    pub fn inspect<R>(&self, f: impl FnOnce(&VecDeque<T>) -> R) -> R {
        f(&self.lock())
    }
}
