//! Per-user async locks so one user's events never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default, Clone)]
pub struct UserLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

/// Held while one event of a user is handled.
pub struct UserGuard {
    guard: Option<OwnedMutexGuard<()>>,
    user_id: i64,
    locks: UserLocks,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other event of `user_id` is in flight.
    pub async fn lock(&self, user_id: i64) -> UserGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(user_id).or_default().clone()
        };
        UserGuard { guard: Some(slot.lock_owned().await), user_id, locks: self.clone() }
    }

    /// Users with an event in flight or queued.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry plus our guard; anything more is a waiter.
        if let Some(slot) = map.get(&self.user_id)
            && Arc::strong_count(slot) <= 2
        {
            map.remove(&self.user_id);
        }
        self.guard.take();
    }
}
