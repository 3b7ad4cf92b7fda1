//! In-memory advisory file locks with lease expiry

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::collaborators::{FileLease, LockManager};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Holder {
    owner: String,
    token: Uuid,
    expires_at: Instant,
}

type LockTable = Arc<Mutex<HashMap<String, Holder>>>;

#[derive(Clone, Default)]
pub struct MemoryLockManager {
    locks: LockTable,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `scope/name`, if its lease has not run out.
    pub async fn holder(&self, scope: &str, name: &str) -> Option<String> {
        let locks = self.locks.lock().await;
        locks
            .get(&lock_key(scope, name))
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.owner.clone())
    }
}

fn lock_key(scope: &str, name: &str) -> String {
    format!("{}/{}", scope, name)
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(
        &self,
        scope: &str,
        name: &str,
        owner: &str,
        lease: Duration,
        wait_for_lock: bool,
    ) -> Result<Option<Arc<dyn FileLease>>> {
        let key = lock_key(scope, name);

        loop {
            {
                let mut locks = self.locks.lock().await;
                let now = Instant::now();
                let free = locks.get(&key).map_or(true, |h| h.expires_at <= now);

                if free {
                    let token = Uuid::new_v4();
                    locks.insert(
                        key.clone(),
                        Holder {
                            owner: owner.to_string(),
                            token,
                            expires_at: now + lease,
                        },
                    );
                    debug!(lock = %key, owner, "Acquired file lock");

                    return Ok(Some(Arc::new(MemoryFileLease {
                        locks: self.locks.clone(),
                        key,
                        token,
                    })));
                }
            }

            if !wait_for_lock {
                return Ok(None);
            }
            sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

pub struct MemoryFileLease {
    locks: LockTable,
    key: String,
    token: Uuid,
}

#[async_trait]
impl FileLease for MemoryFileLease {
    async fn renew(&self, duration: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(&self.key) {
            Some(holder) if holder.token == self.token => {
                holder.expires_at = Instant::now() + duration;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, completed: bool) -> Result<()> {
        let mut locks = self.locks.lock().await;
        if locks.get(&self.key).is_some_and(|h| h.token == self.token) {
            locks.remove(&self.key);
            debug!(lock = %self.key, completed, "Released file lock");
        }
        Ok(())
    }
}
