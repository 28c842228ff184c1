use std::thread;

/// # Pill
///
/// A poison pill carried by every worker thread.
///
/// A worker that panics never reaches the code that would answer its clients
/// or wake the threads waiting on it. The `Pill` notices the unwind when it
/// is dropped (`thread::panicking()`) and runs `on_panic`, which tears the
/// pipeline down so nobody waits on the dead thread.
///
/// Create it first in the thread body so it is dropped last.
pub(crate) struct Pill<F: FnOnce()> {
    on_panic: Option<F>,
}

impl<F: FnOnce()> Pill<F> {
    /// Creates a new `Pill`.
    ///
    /// # Parameters
    ///
    /// * `on_panic` - Teardown to run if the owning thread unwinds
    ///
    /// # Returns
    ///
    /// A guard that does nothing when dropped normally
    pub fn new(on_panic: F) -> Self {
        Self {
            on_panic: Some(on_panic),
        }
    }
}

impl<F: FnOnce()> Drop for Pill<F> {
    fn drop(&mut self) {
        if thread::panicking() {
            if let Some(on_panic) = self.on_panic.take() {
                on_panic();
            }
        }
    }
}
