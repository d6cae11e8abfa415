//! Per-session single-flight coordination.
//!
//! Exactly one agent turn may run per session key; later arrivals queue
//! FIFO behind the fair semaphore. The coordinator also tracks the active
//! turn's cancellation token so a new arrival can abort its predecessor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct FlightCoordinator {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl FlightCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the session slot, waiting behind any active turn.
    pub async fn acquire(&self, session_key: &str, cancel: CancellationToken) -> FlightGuard {
        let sem = {
            let mut locks = self.locks.lock().expect("flight locks");
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = sem.acquire_owned().await.expect("semaphore closed");

        self.active
            .lock()
            .expect("flight active")
            .insert(session_key.to_string(), cancel);

        FlightGuard {
            _permit: permit,
            session_key: session_key.to_string(),
            active: self.active.clone(),
        }
    }

    /// Acquire without waiting; None when the session is busy.
    pub fn try_acquire(&self, session_key: &str, cancel: CancellationToken) -> Option<FlightGuard> {
        let sem = {
            let mut locks = self.locks.lock().expect("flight locks");
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = sem.try_acquire_owned().ok()?;

        self.active
            .lock()
            .expect("flight active")
            .insert(session_key.to_string(), cancel);

        Some(FlightGuard {
            _permit: permit,
            session_key: session_key.to_string(),
            active: self.active.clone(),
        })
    }

    /// Cancel the turn currently holding the slot, if any. Returns whether
    /// an active turn was signalled.
    pub fn cancel_active(&self, session_key: &str) -> bool {
        let active = self.active.lock().expect("flight active");
        match active.get(session_key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_key: &str) -> bool {
        self.active
            .lock()
            .expect("flight active")
            .contains_key(session_key)
    }

    /// Drop semaphores nobody holds; called opportunistically.
    pub fn cleanup_unused(&self) {
        let mut locks = self.locks.lock().expect("flight locks");
        locks.retain(|_, sem| sem.available_permits() < 1);
    }
}

/// Releases the session slot (and the active-token entry) on drop.
pub struct FlightGuard {
    _permit: OwnedSemaphorePermit,
    session_key: String,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("flight active")
            .remove(&self.session_key);
    }
}
