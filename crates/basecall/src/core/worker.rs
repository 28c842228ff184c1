//! Named OS threads backing the pipeline.

use std::thread::{self, JoinHandle};
use tracing::warn;

use crate::error::CallerError;

/// A handle to one pipeline thread.
///
/// The thread is stopped through the queues it consumes, not through the
/// handle; the handle only names and joins it.
pub(crate) struct WorkerHandle {
    /// Thread name, also used in logs and panic reports
    name: String,

    /// Becomes `None` once the thread is joined
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns `body` on a new thread called `name`.
    ///
    /// # Parameters
    ///
    /// * `name` - Thread name, shown in panic messages and logs
    /// * `body` - The loop the thread runs until its queue is terminated
    ///
    /// # Returns
    ///
    /// The handle used to join the thread, or
    /// [`CallerError::ThreadSpawnFailed`] if the OS refused to create it
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, CallerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| CallerError::ThreadSpawnFailed(format!("{name}: {e}")))?;
        Ok(Self {
            name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to exit. Returns `false` if it panicked.
    ///
    /// Joining twice is a no-op.
    pub fn join(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(()) => true,
                Err(_) => {
                    warn!("Worker thread {} panicked", self.name);
                    false
                }
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_worker_runs_on_named_thread() {
        let mut worker = WorkerHandle::spawn("basecall-test", || {
            assert_eq!(thread::current().name(), Some("basecall-test"));
        })
        .unwrap();
        assert_eq!(worker.name(), "basecall-test");
        assert!(worker.join());
    }

    #[test]
    fn test_join_waits_for_exit() {
        let done = Arc::new(AtomicBool::new(false));
        let mut worker = {
            let done = done.clone();
            WorkerHandle::spawn("basecall-sleeper", move || {
                thread::sleep(Duration::from_millis(30));
                done.store(true, Ordering::SeqCst);
            })
            .unwrap()
        };
        assert!(worker.join());
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_join_reports_panic() {
        let mut worker = WorkerHandle::spawn("basecall-panics", || panic!("boom")).unwrap();
        assert!(!worker.join());
        // This should not panic even though the handle is gone
        assert!(worker.join());
    }
}
