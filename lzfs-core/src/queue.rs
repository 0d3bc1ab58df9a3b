//! Bounded multi-producer, single-consumer work queue.
//!
//! Submitters are throttled by the queue capacity: once `capacity` submitted
//! items are waiting, [`BoundedQueue::push`] blocks until the consumer pops
//! one. Pipeline stages hand work to each other with
//! [`BoundedQueue::forward`], which is admitted past the capacity because the
//! item already holds a submission slot upstream. Two stages that forward to
//! each other therefore never wait on one another.
//!
//! Consumers stop on [`QueueItem::Shutdown`], which is ordered like any other
//! item: it is only popped after everything queued before it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// An entry travelling through a [`BoundedQueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem<T> {
    /// A unit of real work.
    Work(T),

    /// Poison pill: the consumer should stop after this item.
    Shutdown,
}

#[cfg(test)]
impl<T> QueueItem<T> {
    /// Returns true for the shutdown sentinel.
    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// The queue was closed by its consumer; the rejected item is handed back.
pub struct Closed<T>(pub QueueItem<T>);

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is closed")
    }
}

impl<T> std::error::Error for Closed<T> {}

/// Failure of a non-blocking push.
#[cfg(test)]
pub(crate) enum TryPushError<T> {
    /// The queue holds `capacity` submitted items.
    Full(QueueItem<T>),

    /// The queue was closed by its consumer.
    Closed(QueueItem<T>),
}

#[cfg(test)]
impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct Entry<T> {
    item: QueueItem<T>,
    /// Whether this entry occupies a submission slot.
    counted: bool,
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    /// Number of queued entries that occupy a submission slot.
    admitted: usize,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

/// Fixed-capacity FIFO with blocking push and pop.
///
/// Cloning yields another handle to the same queue.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.shared.capacity)
            .field("len", &state.entries.len())
            .field("admitted", &state.admitted)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue admitting at most `capacity` submitted items.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: VecDeque::with_capacity(capacity),
                    admitted: 0,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Pushes a submitted item, blocking while the queue is at capacity.
    pub fn push(&self, item: QueueItem<T>) -> Result<(), Closed<T>> {
        let mut state = self.lock();
        while !state.closed && state.admitted >= self.shared.capacity {
            state = self
                .shared
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(Closed(item));
        }
        self.enqueue(&mut state, item, true);
        Ok(())
    }

    /// Pushes a submitted item without blocking.
    #[cfg(test)]
    pub(crate) fn try_push(&self, item: QueueItem<T>) -> Result<(), TryPushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.admitted >= self.shared.capacity {
            return Err(TryPushError::Full(item));
        }
        self.enqueue(&mut state, item, true);
        Ok(())
    }

    /// Hands an item over from another pipeline stage.
    ///
    /// Never blocks on capacity: the item was admitted when it was submitted.
    pub fn forward(&self, item: QueueItem<T>) -> Result<(), Closed<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(Closed(item));
        }
        self.enqueue(&mut state, item, false);
        Ok(())
    }

    /// Pops the oldest item, blocking while the queue is empty.
    ///
    /// A closed and drained queue yields [`QueueItem::Shutdown`].
    pub fn pop(&self) -> QueueItem<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = self.dequeue(&mut state) {
                return item;
            }
            if state.closed {
                return QueueItem::Shutdown;
            }
            state = self
                .shared
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Pops the oldest item if there is one.
    #[cfg(test)]
    pub(crate) fn try_pop(&self) -> Option<QueueItem<T>> {
        let mut state = self.lock();
        self.dequeue(&mut state)
    }

    /// Closes the queue and returns everything still queued.
    ///
    /// Blocked pushers are released with [`Closed`]. The drained items are
    /// returned so the caller drops them outside the queue lock.
    pub fn close(&self) -> Vec<QueueItem<T>> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.admitted = 0;
            state.entries.drain(..).map(|e| e.item).collect()
        };
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        drained
    }

    /// Number of queued items, forwarded ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Maximum number of submitted items the queue holds.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn enqueue(&self, state: &mut State<T>, item: QueueItem<T>, counted: bool) {
        if counted {
            state.admitted += 1;
        }
        state.entries.push_back(Entry { item, counted });
        self.shared.not_empty.notify_one();
    }

    fn dequeue(&self, state: &mut State<T>) -> Option<QueueItem<T>> {
        let entry = state.entries.pop_front()?;
        if entry.counted {
            state.admitted -= 1;
            self.shared.not_full.notify_one();
        }
        Some(entry.item)
    }

    // Critical sections never panic, so a poisoned lock still guards a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
