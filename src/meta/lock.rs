//! Distributed lock service seam

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// A held distributed lock. Released on drop; `is_held` re-checks
/// liveness against the service before the critical section.
pub trait DistLock: Send + Sync {
    fn name(&self) -> &str;
    fn is_held(&self) -> bool;
}

#[async_trait]
pub trait DistLockService: Send + Sync {
    /// Acquire `name` for `who`, retrying until `timeout`. On failure
    /// reports the current holder via `LockContention`.
    async fn try_lock(
        &self,
        name: &str,
        who: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistLock>>;
}

/// In-process lock registry shared by every runtime in a test cluster.
pub struct MemLockService {
    locks: Arc<DashMap<String, (u64, String)>>,
    next_token: AtomicU64,
}

impl MemLockService {
    pub fn new() -> Self {
        MemLockService {
            locks: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Current holder of a lock, if any.
    pub fn holder(&self, name: &str) -> Option<String> {
        self.locks.get(name).map(|e| e.value().1.clone())
    }
}

impl Default for MemLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistLockService for MemLockService {
    async fn try_lock(
        &self,
        name: &str,
        who: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistLock>> {
        let deadline = Instant::now() + timeout;
        loop {
            let token = self.next_token.fetch_add(1, Ordering::SeqCst);
            let mut holder = None;
            match self.locks.entry(name.to_string()) {
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert((token, who.to_string()));
                    debug!(lock = name, who, "distributed lock acquired");
                    return Ok(Box::new(MemLock {
                        locks: Arc::clone(&self.locks),
                        name: name.to_string(),
                        token,
                    }));
                }
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    holder = Some(entry.get().1.clone());
                }
            }
            if Instant::now() >= deadline {
                return Err(MigrateError::LockContention {
                    who: holder.unwrap_or_else(|| "unknown".to_string()),
                });
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

struct MemLock {
    locks: Arc<DashMap<String, (u64, String)>>,
    name: String,
    token: u64,
}

impl DistLock for MemLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_held(&self) -> bool {
        self.locks
            .get(&self.name)
            .map(|e| e.value().0 == self.token)
            .unwrap_or(false)
    }
}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.name, |_, (token, _)| *token == self.token);
    }
}
