//! Cancellable periodic background work.
//!
//! The timeout monitor and the rate-limit sweeper both run on a
//! [`PeriodicTask`]: a named worker thread that ticks at a fixed interval
//! and can be stopped promptly, including mid-wait, so shutdown never
//! stalls on a sleeping timer.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

/// Take a mutex guard even if a previous holder panicked. The guarded
/// state in this crate stays consistent across panics (single-field
/// updates), so recovering beats propagating the poison.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("recovering from poisoned mutex");
            poisoned.into_inner()
        }
    }
}

struct TaskShared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

pub struct PeriodicTask {
    name: &'static str,
    shared: Arc<TaskShared>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a named worker that invokes `tick` every `interval` until
    /// [`stop`](Self::stop) is called or the task is dropped.
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> io::Result<PeriodicTask>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let guard = lock_or_recover(&loop_shared.stopped);
                let (guard, wait) = loop_shared
                    .wake
                    .wait_timeout_while(guard, interval, |stopped| !*stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if *guard {
                    break;
                }
                drop(guard);
                if wait.timed_out() {
                    tick();
                }
            })?;
        Ok(PeriodicTask {
            name,
            shared,
            worker: Some(worker),
        })
    }

    /// Signal the worker and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        *lock_or_recover(&self.shared.stopped) = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(task = self.name, "periodic worker panicked before shutdown");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
