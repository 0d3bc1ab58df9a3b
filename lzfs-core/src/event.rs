//! One-shot completion event.
//!
//! Each work descriptor owns one event. The stage that finishes the work
//! raises it exactly once; any number of threads may block on it, poll it,
//! or await it from async code.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

struct Waiters {
    raised: bool,
    wakers: Vec<Waker>,
}

/// A signal that can be raised once and observed many times.
pub struct CompletionEvent {
    raised: AtomicBool,
    waiters: Mutex<Waiters>,
    cond: Condvar,
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("raised", &self.is_raised())
            .finish()
    }
}

impl CompletionEvent {
    /// Creates an unraised event.
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            waiters: Mutex::new(Waiters {
                raised: false,
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Raises the event and wakes every waiter.
    ///
    /// Returns `false` if the event was already raised, in which case nothing
    /// happens.
    pub fn signal(&self) -> bool {
        let wakers = {
            let mut waiters = self.lock();
            if waiters.raised {
                return false;
            }
            waiters.raised = true;
            self.raised.store(true, Ordering::Release);
            std::mem::take(&mut waiters.wakers)
        };

        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Checks whether the event was raised without blocking.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the event is raised.
    pub fn wait(&self) {
        if self.is_raised() {
            return;
        }

        let mut waiters = self.lock();
        while !waiters.raised {
            waiters = self
                .cond
                .wait(waiters)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns a future that resolves once the event is raised.
    pub fn raised(&self) -> Raised<'_> {
        Raised { event: self }
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future returned by [`CompletionEvent::raised`].
#[must_use = "futures do nothing unless polled"]
pub struct Raised<'a> {
    event: &'a CompletionEvent,
}

impl Future for Raised<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.event.is_raised() {
            return Poll::Ready(());
        }

        let mut waiters = self.event.lock();
        if waiters.raised {
            return Poll::Ready(());
        }
        if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
