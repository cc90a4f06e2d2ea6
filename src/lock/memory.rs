use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::LockService;

/// Upper bound on one sleep while waiting, so expired holds are noticed.
const POLL: Duration = Duration::from_millis(20);

/// In-process lock table. A hold expires on its own after its hold timeout.
#[derive(Default)]
pub struct MemoryLockService {
    held: Mutex<HashMap<String, Instant>>,
    released: Notify,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.get(key).is_some_and(|expiry| *expiry > Instant::now()))
            .unwrap_or(false)
    }

    fn try_take(&self, key: &str, hold: Duration) -> Result<bool> {
        let mut held = self.held.lock().map_err(|_| anyhow!("lock table poisoned"))?;
        let now = Instant::now();
        match held.get(key) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + hold);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, hold: Duration, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_take(key, hold)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let nap = (deadline - now).min(POLL);
            let _ = tokio::time::timeout(nap, self.released.notified()).await;
        }
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let removed = {
            let mut held = self.held.lock().map_err(|_| anyhow!("lock table poisoned"))?;
            held.remove(key).is_some()
        };
        if removed {
            self.released.notify_waiters();
        }
        Ok(removed)
    }
}
