//! Per-session serialization with a bounded wait queue (spec §4.1 "Per
//! session, turns are serialized"; §5 "FIFO queue depth Q").
//!
//! Each session gets its own `Mutex` so turns against different sessions
//! never block each other. A `Semaphore` of `Q` permits bounds how many
//! callers may be waiting for (or holding) that mutex at once; beyond
//! that, entry is refused outright rather than queued indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use turnflow_core::id::SessionId;

struct Slot {
    queue: Arc<Semaphore>,
    serialize: Arc<Mutex<()>>,
}

/// Holds a session's queue slot for the lifetime of one turn. Dropping it
/// frees the slot for the next waiter.
pub struct SessionGuard {
    serialize: Arc<Mutex<()>>,
    _queue_permit: OwnedSemaphorePermit,
}

impl SessionGuard {
    /// Acquire the session's serialization lock, blocking until any
    /// earlier turn against the same session has released it.
    pub async fn serialize(&self) -> OwnedMutexGuard<()> {
        self.serialize.clone().lock_owned().await
    }
}

/// Lazily-created, per-session lock slots.
pub struct SessionLocks {
    slots: Mutex<HashMap<SessionId, Arc<Slot>>>,
    queue_depth: usize,
}

impl SessionLocks {
    /// Build a lock table whose per-session wait queue holds at most
    /// `queue_depth` callers.
    pub fn new(queue_depth: usize) -> Self {
        Self { slots: Mutex::new(HashMap::new()), queue_depth: queue_depth.max(1) }
    }

    /// Reserve a queue slot for `session`, creating its lock table entry
    /// on first use. Returns `None` if the session's queue is already
    /// full (spec §7 `SessionBusy`).
    pub async fn try_enter(&self, session: &SessionId) -> Option<SessionGuard> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(session.clone())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        queue: Arc::new(Semaphore::new(self.queue_depth)),
                        serialize: Arc::new(Mutex::new(())),
                    })
                })
                .clone()
        };

        let permit = slot.queue.clone().try_acquire_owned().ok()?;
        Some(SessionGuard { serialize: slot.serialize.clone(), _queue_permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_sessions_do_not_contend() {
        let locks = SessionLocks::new(1);
        let a = locks.try_enter(&SessionId::new("a")).await;
        let b = locks.try_enter(&SessionId::new("b")).await;
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn queue_depth_is_enforced_per_session() {
        let locks = SessionLocks::new(1);
        let session = SessionId::new("s1");
        let first = locks.try_enter(&session).await;
        assert!(first.is_some());
        let second = locks.try_enter(&session).await;
        assert!(second.is_none());
        drop(first);
        let third = locks.try_enter(&session).await;
        assert!(third.is_some());
    }
}
