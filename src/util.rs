//! Small synchronization helpers shared across the stack.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Locks a mutex, recovering the guard from a poisoned lock. The stack's
/// shared state stays usable even if a caller thread panicked while holding
/// a lock.
pub(crate) fn lock_ok<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Binary signal used to wake a blocked sender on ACK or a blocked
/// connector on SYN-ACK. Raising an already-raised signal is a no-op;
/// taking consumes the raise.
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            raised: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn raise(&self) {
        *lock_ok(&self.raised) = true;
        self.cond.notify_one();
    }

    pub fn clear(&self) {
        *lock_ok(&self.raised) = false;
    }

    /// Blocks until the signal is raised or `timeout` elapses (`None` waits
    /// forever). Returns whether the signal was taken.
    pub fn take(&self, timeout: Option<Duration>) -> bool {
        let mut raised = lock_ok(&self.raised);
        match timeout {
            None => {
                while !*raised {
                    raised = match self.cond.wait(raised) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*raised {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    raised = match self.cond.wait_timeout(raised, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
        *raised = false;
        true
    }
}

/// Bounded multi-producer multi-consumer queue backing the per-socket
/// receive and accept queues. Waiting consumers park on a condvar, so
/// producers (and the ingress path draining a queue) are never blocked by
/// a consumer sitting in `pop`.
pub(crate) struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, or hands it back when the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = lock_ok(&self.items);
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Dequeues the oldest item, blocking up to `timeout` (`None` waits
    /// forever). Returns `None` on timeout.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = lock_ok(&self.items);
        match timeout {
            None => loop {
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                items = match self.cond.wait(items) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(item) = items.pop_front() {
                        return Some(item);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    items = match self.cond.wait_timeout(items, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Empties the queue and returns what was in it.
    pub fn drain(&self) -> Vec<T> {
        lock_ok(&self.items).drain(..).collect()
    }
}
