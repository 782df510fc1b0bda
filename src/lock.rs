//! Redis-backed distributed lock
//!
//! A named, TTL-based mutual exclusion primitive shared between crawler
//! processes. Used internally by the proxy pool's reset path in
//! multi-process deployments and exposed for task logic that needs
//! cross-process coordination.
//!
//! The backing store sits behind the [`LockStore`] seam: [`RedisStore`]
//! wraps an explicit redis connection handed in by the embedding process (no
//! global connection cache), and [`MemoryStore`] implements the same
//! contract in-process for tests and single-process setups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::debug;

use crate::proxy::now_ts;

/// Errors raised by lock construction and store operations.
///
/// Self-healing cases (stale key, missing expiry) are handled inside
/// [`RedisLock::acquire`]; anything else propagates.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock key is empty")]
    EmptyKey,

    #[error("lock store operation failed: {0}")]
    Store(#[from] redis::RedisError),
}

/// Minimal key-value contract the lock needs: atomic create-if-absent,
/// expiry update, remaining-TTL query and delete.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create `key` with `value` only if absent; returns whether it was set.
    async fn set_nx(&self, key: &str, value: f64) -> Result<bool, LockError>;
    async fn expire(&self, key: &str, seconds: i64) -> Result<(), LockError>;
    /// Remaining TTL in seconds; negative when the key is missing or has no
    /// expiry (redis convention: -2 missing, -1 no expiry).
    async fn ttl(&self, key: &str) -> Result<i64, LockError>;
    async fn del(&self, key: &str) -> Result<(), LockError>;
}

/// Production store over an explicit redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_nx(&self, key: &str, value: f64) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        Ok(conn.set_nx(key, value).await?)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, seconds).await?)
    }

    async fn ttl(&self, key: &str) -> Result<i64, LockError> {
        let mut conn = self.conn.clone();
        Ok(conn.ttl(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        Ok(conn.del(key).await?)
    }
}

/// In-process store honoring the same TTL semantics as redis.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, (f64, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(map: &mut HashMap<String, (f64, Option<Instant>)>, key: &str) {
        if let Some((_, Some(deadline))) = map.get(key) {
            if Instant::now() >= *deadline {
                map.remove(key);
            }
        }
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: f64) -> Result<bool, LockError> {
        let mut map = self.inner.lock();
        Self::prune(&mut map, key);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), (value, None));
        Ok(true)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<(), LockError> {
        let mut map = self.inner.lock();
        if let Some(entry) = map.get_mut(key) {
            entry.1 = Some(Instant::now() + Duration::from_secs(seconds.max(0) as u64));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, LockError> {
        let mut map = self.inner.lock();
        Self::prune(&mut map, key);
        match map.get(key) {
            None => Ok(-2),
            Some((_, None)) => Ok(-1),
            Some((_, Some(deadline))) => {
                Ok(deadline.saturating_duration_since(Instant::now()).as_secs() as i64)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<(), LockError> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

/// Lock timing configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Key expiry: a crashed holder's lock heals itself after this long.
    pub ttl: i64,
    /// How long `acquire` may wait for a contended lock; <= 0 means a single
    /// attempt with no waiting.
    pub wait_timeout: i64,
    /// Poll cadence while waiting. When unset, a short wait budget (<= 10s)
    /// polls every second and a long one every five.
    pub poll_interval: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: 300,
            wait_timeout: 8 * 3600,
            poll_interval: None,
        }
    }
}

/// Named TTL lock over a [`LockStore`].
///
/// Failure to acquire is a state (`locked() == false`), not an error: the
/// caller must check. Supports manual acquire/release as well as scoped use
/// through [`locked_scope`](RedisLock::locked_scope).
pub struct RedisLock {
    store: Arc<dyn LockStore>,
    key: String,
    cfg: LockConfig,
    break_wait: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    locked: bool,
}

impl RedisLock {
    /// Fails fast when `name` is empty.
    pub fn new(name: &str, store: Arc<dyn LockStore>, cfg: LockConfig) -> Result<Self, LockError> {
        if name.is_empty() {
            return Err(LockError::EmptyKey);
        }
        Ok(Self {
            store,
            key: format!("redis_lock:{}", name),
            cfg,
            break_wait: None,
            locked: false,
        })
    }

    /// Install a predicate polled while waiting; returning true ends the
    /// wait unlocked.
    pub fn with_break_wait(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.break_wait = Some(Box::new(f));
        self
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lock, waiting up to the configured budget.
    ///
    /// Returns whether the lock is now held. A previous holder's crash is
    /// healed in passing: an expired-but-unreaped key is deleted and retried
    /// immediately, and a TTL larger than the configured one (an
    /// expire-setting race at acquisition) is clamped down.
    pub async fn acquire(&mut self) -> Result<bool, LockError> {
        let start = Instant::now();
        debug!(key = %self.key, "acquiring lock");
        loop {
            if self.store.set_nx(&self.key, now_ts()).await? {
                self.store.expire(&self.key, self.cfg.ttl).await?;
                self.locked = true;
                debug!(key = %self.key, "lock acquired");
                break;
            }
            let ttl = self.store.ttl(&self.key).await?;
            if ttl < 0 {
                // Holder died between SETNX and EXPIRE; reap and retry.
                self.store.del(&self.key).await?;
                continue;
            } else if ttl > self.cfg.ttl {
                self.store.expire(&self.key, self.cfg.ttl).await?;
            }
            if self.cfg.wait_timeout <= 0 {
                break;
            }
            if start.elapsed().as_secs() as i64 > self.cfg.wait_timeout {
                break;
            }
            if let Some(break_wait) = &self.break_wait {
                if break_wait() {
                    debug!(key = %self.key, "break_wait ended lock wait");
                    break;
                }
            }
            let delay = self.cfg.poll_interval.unwrap_or(if self.cfg.wait_timeout > 10 {
                Duration::from_secs(5)
            } else {
                Duration::from_secs(1)
            });
            debug!(key = %self.key, waited = ?start.elapsed(), "waiting for lock");
            tokio::time::sleep(delay).await;
        }
        if !self.locked {
            debug!(key = %self.key, "lock not acquired");
        }
        Ok(self.locked)
    }

    /// Release the lock if held, or unconditionally with `force`.
    /// Releasing an already-released lock is a no-op.
    pub async fn release(&mut self, force: bool) -> Result<(), LockError> {
        if self.locked || force {
            self.store.del(&self.key).await?;
            self.locked = false;
        }
        Ok(())
    }

    /// Extend the current TTL by `extra` seconds, returning the new TTL or
    /// the store's negative sentinel when the key has already expired.
    pub async fn prolong(&self, extra: i64) -> Result<i64, LockError> {
        let ttl = self.store.ttl(&self.key).await?;
        if ttl < 0 {
            return Ok(ttl);
        }
        self.store.expire(&self.key, ttl + extra).await?;
        self.store.ttl(&self.key).await
    }

    /// Remaining lifetime of the lock key.
    pub async fn ttl(&self) -> Result<i64, LockError> {
        self.store.ttl(&self.key).await
    }

    /// Scoped acquisition: acquire on entry, run `f` if the lock was taken,
    /// release on exit. Returns `None` when the lock was not acquired.
    pub async fn locked_scope<T, F, Fut>(mut self, f: F) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if !self.acquire().await? {
            return Ok(None);
        }
        let out = f().await;
        self.release(false).await?;
        Ok(Some(out))
    }
}
