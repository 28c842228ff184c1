//! Generation token ordering accelerator writes against CPU reads.
//!
//! Every batch gets the next completion id when it is submitted. The decode
//! threads signal that id once every chunk of the batch has been decoded,
//! and the accelerator waits for `id - 1` before writing the next batch's
//! scores into the shared buffers. Id `0` counts as signaled from the start.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct EventState {
    value: u64,
    abandoned: bool,
}

/// A monotonically increasing signaled value with blocking waits.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    state: Mutex<EventState>,
    signaled: Condvar,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaled_value(&self) -> u64 {
        self.lock().value
    }

    /// Raises the signaled value to `value`. Lower values are ignored.
    pub fn signal(&self, value: u64) {
        let mut state = self.lock();
        if value > state.value {
            state.value = value;
            self.signaled.notify_all();
        }
    }

    /// Blocks until the signaled value reaches `value`.
    ///
    /// Returns `false` if the event was abandoned first.
    pub fn wait_for(&self, value: u64) -> bool {
        let state = self
            .signaled
            .wait_while(self.lock(), |s| s.value < value && !s.abandoned)
            .unwrap_or_else(PoisonError::into_inner);
        state.value >= value
    }

    /// Like [`CompletionEvent::wait_for`], giving up after `timeout`.
    pub fn wait_for_timeout(&self, value: u64, timeout: Duration) -> bool {
        let (state, _) = self
            .signaled
            .wait_timeout_while(self.lock(), timeout, |s| s.value < value && !s.abandoned)
            .unwrap_or_else(PoisonError::into_inner);
        state.value >= value
    }

    /// Releases every waiter without signaling; used when the pipeline is
    /// torn down and the awaited batch will never be decoded.
    pub(crate) fn abandon(&self) {
        self.lock().abandoned = true;
        self.signaled.notify_all();
    }

    pub(crate) fn reset_abandoned(&self) {
        self.lock().abandoned = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A wait on a [`CompletionEvent`] handed to the accelerator.
#[derive(Debug, Clone, Copy)]
pub struct EventWait<'a> {
    event: &'a CompletionEvent,
    value: u64,
}

impl<'a> EventWait<'a> {
    pub fn new(event: &'a CompletionEvent, value: u64) -> Self {
        Self { event, value }
    }

    /// The signaled value the device must wait for
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.event.signaled_value() >= self.value
    }

    /// Blocks until the buffers are free. Returns `false` if the pipeline was
    /// torn down while waiting.
    pub fn wait(&self) -> bool {
        self.event.wait_for(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_is_signaled_from_creation() {
        let event = CompletionEvent::new();
        assert!(EventWait::new(&event, 0).is_ready());
        assert!(event.wait_for(0));
        assert!(!EventWait::new(&event, 1).is_ready());
    }

    #[test]
    fn test_signal_is_monotonic() {
        let event = CompletionEvent::new();
        event.signal(3);
        event.signal(2);
        assert_eq!(event.signaled_value(), 3);
    }

    #[test]
    fn test_wait_blocks_until_signaled() {
        let event = Arc::new(CompletionEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_for(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        event.signal(1);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        event.signal(2);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let event = CompletionEvent::new();
        assert!(!event.wait_for_timeout(1, Duration::from_millis(10)));
    }

    #[test]
    fn test_abandon_releases_waiters() {
        let event = Arc::new(CompletionEvent::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || EventWait::new(&event, 5).wait())
        };
        thread::sleep(Duration::from_millis(20));
        event.abandon();
        assert!(!waiter.join().unwrap());

        event.reset_abandoned();
        assert!(!event.wait_for_timeout(5, Duration::from_millis(10)));
    }
}
