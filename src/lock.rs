//! Named mutual exclusion spanning all orchestrator processes.
//!
//! Locks are keyed by arbitrary strings (`"package:<id>:stemcell:<id>"`,
//! `"release:<name>"`). The [`DeployLock`] trait is the seam: production
//! deployments back it with an external lock service, tests and
//! single-process runs use [`InMemoryLocks`]. The returned guard releases the
//! lock on every exit path — drop semantics cover normal return, error, and
//! cancellation alike.

use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Holds a named lock until dropped.
pub struct LockGuard {
    key: String,
    _hold: Box<dyn Any + Send>,
}

impl LockGuard {
    /// Wrap an implementation-specific hold. `hold`'s drop must release the
    /// underlying lock.
    pub fn new(key: &str, hold: Box<dyn Any + Send>) -> Self {
        Self {
            key: key.to_string(),
            _hold: hold,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(key = %self.key, "released lock");
    }
}

/// Cross-process advisory locking.
#[async_trait]
pub trait DeployLock: Send + Sync {
    /// Block until the named lock is held.
    async fn acquire(&self, key: &str) -> Result<LockGuard>;
}

/// Single-process lock table. One async mutex per key, created on first use.
#[derive(Default)]
pub struct InMemoryLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[async_trait]
impl DeployLock for InMemoryLocks {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let entry = self.entry(key);
        let hold = entry.lock_owned().await;
        debug!(key, "acquired lock");
        Ok(LockGuard::new(key, Box::new(hold)))
    }
}
