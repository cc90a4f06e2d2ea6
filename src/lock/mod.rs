//! Named exclusive locks used to serialise terminate against the executor.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_lock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Pause between two acquisition attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(25);

/// A lock service. Hold timeouts are enforced by the service itself.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take `key` for at most `hold`, waiting up to `wait` for it to
    /// become free. Returns `false` if it stayed busy.
    async fn acquire(&self, key: &str, hold: Duration, wait: Duration) -> Result<bool>;

    /// Release `key`. Returns `false` if it was not held.
    async fn release(&self, key: &str) -> Result<bool>;
}

/// Timeouts for one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub hold: Duration,
    pub wait: Duration,
    /// Give up after this long. `None` retries until the lock is obtained.
    pub deadline: Option<Duration>,
}

/// A held lock. Call [`LockGuard::release`]; dropping an unreleased guard
/// schedules the release on the current runtime.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        self.service.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = service.release(&key).await {
                        warn!(key = %key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => warn!(key = %key, "Lock guard dropped outside a runtime; relying on hold timeout"),
        }
    }
}

/// Lock key guarding terminate for one instance.
pub fn terminate_key(workflow_id: i64) -> String {
    format!("terminate:{}", workflow_id)
}

/// Acquire `key`, retrying until it is obtained or the policy deadline passes.
pub async fn acquire_exclusive(
    service: Arc<dyn LockService>,
    key: &str,
    policy: &LockPolicy,
) -> Result<LockGuard> {
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if service.acquire(key, policy.hold, policy.wait).await? {
            debug!(key = %key, attempts, "Lock acquired");
            return Ok(LockGuard {
                service,
                key: key.to_string(),
                released: false,
            });
        }

        if let Some(deadline) = policy.deadline
            && started.elapsed() >= deadline
        {
            bail!("Timed out acquiring lock '{}' after {} attempts", key, attempts);
        }
        warn!(key = %key, attempts, "Lock busy, retrying");
        tokio::time::sleep(RETRY_PAUSE).await;
    }
}
