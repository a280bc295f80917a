use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::status::{CommError, Status};

/// Tracks the completion status of outstanding operations. Multiple
/// completions for one handle (e.g. the error-handler hook re-firing a
/// callback) are deduplicated: the first recorded status wins.
pub struct HandleManager {
    next: AtomicU64,
    results: Mutex<HashMap<u64, Option<Status>>>,
    cond: Condvar,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next: AtomicU64::new(0),
            results: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    pub fn allocate(&self) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.results.lock().unwrap().insert(handle, None);
        handle
    }

    pub fn mark_done(&self, handle: u64, status: Status) {
        let mut results = self.results.lock().unwrap();
        match results.get_mut(&handle) {
            Some(slot) if slot.is_none() => {
                *slot = Some(status);
                drop(results);
                self.cond.notify_all();
            }
            Some(_) => log::debug!("duplicate completion for handle {} dropped", handle),
            None => log::warn!("completion for unknown handle {}", handle),
        }
    }

    /// True once the operation has completed (in any state).
    pub fn poll(&self, handle: u64) -> bool {
        self.results
            .lock()
            .unwrap()
            .get(&handle)
            .map_or(false, |slot| slot.is_some())
    }

    /// Blocks until completion; with `busy_waiting` the wait spins on the
    /// poll path instead of sleeping on the condvar.
    pub fn wait(&self, handle: u64, busy_waiting: bool) {
        if busy_waiting {
            while !self.poll(handle) {
                std::hint::spin_loop();
            }
            return;
        }
        let mut results = self.results.lock().unwrap();
        while results.get(&handle).map_or(false, |slot| slot.is_none()) {
            let (guard, _) = self
                .cond
                .wait_timeout(results, Duration::from_millis(100))
                .unwrap();
            results = guard;
        }
    }

    /// Removes the handle and returns its final status.
    pub fn release(&self, handle: u64) -> Status {
        match self.results.lock().unwrap().remove(&handle) {
            Some(Some(status)) => status,
            Some(None) => Err(CommError::InProgress),
            None => Err(CommError::InvalidArgument(format!(
                "unknown handle {}",
                handle
            ))),
        }
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_then_release_returns_first_status() {
        let manager = Arc::new(HandleManager::new());
        let handle = manager.allocate();
        assert!(!manager.poll(handle));

        let waiter = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                manager.wait(handle, false);
                manager.poll(handle)
            })
        };
        manager.mark_done(handle, Err(CommError::Aborted("first".into())));
        manager.mark_done(handle, Ok(()));
        assert!(waiter.join().unwrap());
        assert_eq!(
            manager.release(handle),
            Err(CommError::Aborted("first".into()))
        );
    }

    #[test]
    fn releasing_pending_handle_reports_in_progress() {
        let manager = HandleManager::new();
        let handle = manager.allocate();
        assert_eq!(manager.release(handle), Err(CommError::InProgress));
    }
}
