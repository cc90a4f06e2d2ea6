use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::LockService;

const POLL: Duration = Duration::from_millis(50);

/// Deletes the key only if this service still owns it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock service on a shared Redis, using `SET NX PX` with an owner token.
pub struct RedisLockService {
    conn: ConnectionManager,
    token: String,
}

impl RedisLockService {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("Invalid redis url '{}'", url))?;
        let conn = client
            .get_connection_manager()
            .await
            .with_context(|| format!("Failed to connect to redis at '{}'", url))?;
        Ok(Self {
            conn,
            token: Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, hold: Duration, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        let mut conn = self.conn.clone();
        loop {
            let taken: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&self.token)
                .arg("NX")
                .arg("PX")
                .arg(hold.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("Failed to acquire lock '{}'", key))?;
            if taken.is_some() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep((deadline - now).min(POLL)).await;
        }
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to release lock '{}'", key))?;
        Ok(deleted == 1)
    }
}
