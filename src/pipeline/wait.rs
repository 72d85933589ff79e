//! Blocking wait across several streams.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, SdkError};
use crate::pipeline::stream::VideoStream;

/// One blocked caller. Notifiers set the flag under the mutex, so a wakeup
/// raised between registration and `wait` is never lost.
#[derive(Debug, Default)]
pub struct Waiter {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    pub fn notify(&self) {
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        *notified = true;
        self.condvar.notify_all();
    }

    /// Blocks until notified or `deadline` passes. Returns whether a
    /// notification arrived; the flag is consumed.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        while !*notified {
            match deadline {
                None => {
                    notified = self
                        .condvar
                        .wait(notified)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    notified = self
                        .condvar
                        .wait_timeout(notified, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *notified = false;
        true
    }
}

/// Waiters registered on one stream.
#[derive(Debug, Default)]
pub struct WaiterList {
    waiters: Mutex<Vec<Weak<Waiter>>>,
}

impl WaiterList {
    pub fn register(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }

    pub fn unregister(&self, waiter: &Arc<Waiter>) {
        let target = Arc::downgrade(waiter);
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
    }

    pub fn notify_all(&self) {
        let waiters: Vec<Arc<Waiter>> = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for waiter in waiters {
            waiter.notify();
        }
    }

    pub fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blocks until one of `streams` has an unread frame and returns its index.
///
/// When several streams are ready the lowest index wins. `None` waits
/// forever; otherwise [`SdkError::Timeout`] is returned once `timeout` has
/// elapsed. The frame is not consumed: follow with `try_read_frame`.
pub fn wait_for_any(streams: &[&VideoStream], timeout: Option<Duration>) -> Result<usize> {
    if streams.is_empty() {
        return Err(SdkError::InvalidArgument("no streams to wait on".into()));
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let waiter = Arc::new(Waiter::default());
    for stream in streams {
        stream.waiters().register(&waiter);
    }

    let result = loop {
        if let Some(index) = streams.iter().position(|s| s.has_new_frame()) {
            break Ok(index);
        }
        if !waiter.wait_until(deadline) {
            // A frame may have landed right at the deadline.
            match streams.iter().position(|s| s.has_new_frame()) {
                Some(index) => break Ok(index),
                None => break Err(SdkError::Timeout(timeout.unwrap_or_default())),
            }
        }
    };

    for stream in streams {
        stream.waiters().unregister(&waiter);
    }
    trace!(?result, count = streams.len(), "wait_for_any finished");
    result
}
