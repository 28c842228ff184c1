use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A blocking double-ended work queue with a termination flag.
///
/// Producers push at the front and consumers take from the back, giving
/// FIFO order. Termination stops new pushes but lets consumers drain what
/// is already queued; a consumer sees `None` only once the queue is both
/// terminated and empty.
pub(crate) struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    terminated: bool,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                terminated: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Queues `item` and wakes consumers; hands it back if terminated.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.terminated {
                return Err(item);
            }
            state.items.push_front(item);
        }
        self.available.notify_all();
        Ok(())
    }

    /// Takes the oldest item, blocking while the queue is empty.
    ///
    /// The wait wakes every `interval` to re-check the state in addition to
    /// explicit notifications.
    pub fn wait_pop(&self, interval: Duration) -> Option<T> {
        self.wait_claim(interval, |_| ((), true))
            .and_then(|(item, _)| item)
    }

    /// Lets `claim` take part of the oldest item without removing it.
    ///
    /// `claim` runs under the queue lock and returns its result plus whether
    /// the item is now exhausted; exhausted items are removed and returned
    /// alongside the result, so no later caller can see them.
    pub fn wait_claim<R, F>(&self, interval: Duration, mut claim: F) -> Option<(Option<T>, R)>
    where
        F: FnMut(&T) -> (R, bool),
    {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.back() {
                let (result, exhausted) = claim(item);
                let removed = if exhausted { state.items.pop_back() } else { None };
                return Some((removed, result));
            }
            if state.terminated {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stops accepting work and wakes every waiter.
    pub fn terminate(&self) {
        self.lock().terminated = true;
        self.available.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().terminated = false;
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Removes and returns everything still queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).rev().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
