use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{LayerError, Result};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with blocking and timed removal.
///
/// After [`close`](Self::close), blocked and later `get` calls fail with
/// [`LayerError::Closed`] and queued items are dropped.
pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append `item`. Returns it back if the queue is closed.
    pub fn put(&self, item: T) -> std::result::Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    /// Remove the head, blocking until one is available.
    pub fn get(&self) -> Result<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(LayerError::Closed);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Remove the head, waiting at most `timeout`. A zero timeout polls.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(LayerError::Closed);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue, returning the items that were never taken.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        self.ready.notify_all();
        state.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
