//! The proxy pool
//!
//! Owns a bounded collection of [`ProxyItem`]s, refills from a
//! [`ProxySource`], hands out endpoints on demand and demotes or retires
//! unhealthy ones. Safe under concurrent `get`/`append`/`tag`/`reset` from
//! many worker tasks; only one task performs a physical refill at a time,
//! and in multi-process deployments the refill is additionally guarded by
//! the distributed lock so processes sharing a source do not hammer it
//! simultaneously.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::endpoint::ProxyEntry;
use crate::engine::ConfigError;
use crate::lock::{LockConfig, LockStore, RedisLock, RedisStore};
use crate::proxy::{
    now_ts, HealthFlag, LocalState, ProxyItem, ProxyItemConfig, ProxyState, RedisState,
    RetireReason, Validity,
};
use crate::source::ProxySource;

/// Rolling window after which discarded identities may be re-admitted and
/// retained probe timestamps are forgotten.
const DISCARD_WINDOW: Duration = Duration::from_secs(600);

/// A hand-out older than this forces a reset before the next one, so an idle
/// crawler does not keep serving a stale working set.
const IDLE_RESET_AFTER: Duration = Duration::from_secs(180);

/// Bounded internal attempts before `get` surfaces `None`.
const GET_ATTEMPTS: u32 = 3;

/// Pool-level configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target working-set size; -1 = unbounded (track whatever the source
    /// returns).
    pub capacity: i64,
    /// Minimum interval between two physical refills.
    pub reset_interval: Duration,
    /// A refill is forced once this much time passed since the last one,
    /// so fresh endpoints keep arriving even while the queue looks healthy.
    pub reset_interval_max: Duration,
    /// Whether `get` validates items before handing them out.
    pub check_valid: bool,
    /// Fraction of `get` calls that run the opportunistic refill check.
    /// A load-shedding tunable, not a contract; 1.0 checks on every call.
    pub refill_probability: f64,
    /// Health configuration shared by every tracked item.
    pub item: ProxyItemConfig,
    /// Key namespace for redis-mirrored state and the reset lock.
    pub namespace: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: -1,
            reset_interval: Duration::from_secs(5),
            reset_interval_max: Duration::from_secs(180),
            check_valid: true,
            refill_probability: 0.5,
            item: ProxyItemConfig::default(),
            namespace: "crawlpool".to_string(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Currently-available items, round-robin order.
    queue: VecDeque<Arc<ProxyItem>>,
    /// identity -> item for everything currently tracked.
    items: HashMap<String, Arc<ProxyItem>>,
    /// Recently-retired identities blocked from immediate re-admission.
    discarded: HashMap<String, Instant>,
    /// Probe timestamps retained across refills, keyed by identity, so a
    /// fast reset does not re-probe an endpoint validated moments ago.
    probe_memory: HashMap<String, f64>,
    /// LIFO cache of temporary hand-outs for rapid reuse.
    temp: Vec<ProxyEntry>,
}

/// Concurrent pool of upstream proxies.
pub struct ProxyPool {
    cfg: PoolConfig,
    item_cfg: Arc<ProxyItemConfig>,
    source: ProxySource,
    redis: Option<MultiplexedConnection>,
    inner: tokio::sync::Mutex<PoolInner>,
    /// Serializes physical refills; contenders skip rather than block.
    reset_guard: tokio::sync::Mutex<()>,
    /// Consecutive `get` calls that exhausted all attempts.
    no_valid_times: AtomicU32,
    reset_fast_count: AtomicU32,
    /// Size of the last source result, the effective target when unbounded.
    real_max: AtomicUsize,
    last_get: Mutex<Instant>,
    last_reset: Mutex<Option<Instant>>,
}

impl ProxyPool {
    /// Pool with process-local proxy state.
    pub fn new(cfg: PoolConfig, source: ProxySource) -> Result<Self, ConfigError> {
        Self::build(cfg, source, None)
    }

    /// Pool whose item flags are mirrored in redis so multiple processes
    /// agree on them; the connection is an explicit handle owned by the
    /// embedding process.
    pub fn with_redis(
        cfg: PoolConfig,
        source: ProxySource,
        conn: MultiplexedConnection,
    ) -> Result<Self, ConfigError> {
        Self::build(cfg, source, Some(conn))
    }

    fn build(
        cfg: PoolConfig,
        source: ProxySource,
        redis: Option<MultiplexedConnection>,
    ) -> Result<Self, ConfigError> {
        if cfg.capacity == 0 {
            return Err(ConfigError::InvalidPoolCapacity(cfg.capacity));
        }
        if !(0.0..=1.0).contains(&cfg.refill_probability) {
            return Err(ConfigError::InvalidRefillProbability(cfg.refill_probability));
        }
        if source.config().origins.is_empty() {
            warn!("proxy pool constructed without origins; every refill will come up empty");
        }
        Ok(Self {
            item_cfg: Arc::new(cfg.item.clone()),
            cfg,
            source,
            redis,
            inner: tokio::sync::Mutex::new(PoolInner::default()),
            reset_guard: tokio::sync::Mutex::new(()),
            no_valid_times: AtomicU32::new(0),
            reset_fast_count: AtomicU32::new(0),
            real_max: AtomicUsize::new(1000),
            last_get: Mutex::new(Instant::now()),
            last_reset: Mutex::new(None),
        })
    }

    /// Number of items currently queued for hand-out.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Number of identities currently tracked.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Look up a tracked item by identity.
    pub async fn get_item(&self, identity: &str) -> Option<Arc<ProxyItem>> {
        self.inner.lock().await.items.get(identity).cloned()
    }

    /// Push endpoints onto the temporary-reuse cache; `get` serves these
    /// first, newest first, one use each.
    pub async fn add_temp(&self, entries: Vec<ProxyEntry>) {
        self.inner.lock().await.temp.extend(entries);
    }

    /// Hand out one currently-healthy endpoint, or `None` after exhausting
    /// the bounded internal attempts. Absence is not an error; the caller
    /// decides whether to retry or back off.
    pub async fn get(&self) -> Option<ProxyEntry> {
        for _ in 0..GET_ATTEMPTS {
            if let Some(entry) = self.inner.lock().await.temp.pop() {
                return Some(entry);
            }
            if self.last_get.lock().elapsed() > IDLE_RESET_AFTER {
                self.reset(false).await;
            }
            *self.last_get.lock() = Instant::now();

            let Some(item) = self.next_item().await else {
                self.reset(false).await;
                continue;
            };

            if !self.cfg.check_valid {
                let entry = item.checkout();
                self.requeue(item).await;
                return Some(entry);
            }

            match item.is_valid(false).await {
                Validity::Valid { probed } => {
                    if probed {
                        self.inner
                            .lock()
                            .await
                            .probe_memory
                            .insert(item.identity().to_string(), item.probe_ts());
                    }
                    let entry = item.checkout();
                    if item.use_interval().is_some() {
                        item.state().set_use_ts(now_ts()).await;
                    }
                    self.requeue(item).await;
                    return Some(entry);
                }
                Validity::Delay => {
                    // Benched, not dead; keep it circulating.
                    self.requeue(item).await;
                }
                Validity::Invalid(reason) => {
                    self.retire(&item, reason).await;
                }
            }

            if self.no_valid_times.load(Ordering::Relaxed) >= 5 {
                // A near-empty working set plus a long run of failures can
                // starve the last remaining tasks; force fresh candidates.
                self.reset(false).await;
            }
        }
        self.no_valid_times.fetch_add(1, Ordering::Relaxed);
        debug!(attempts = GET_ATTEMPTS, "no valid proxy");
        None
    }

    /// Admit new endpoints, skipping recently-discarded and already-tracked
    /// identities. Returns how many were newly admitted.
    pub async fn append(&self, entries: Vec<ProxyEntry>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut admitted = 0;
        for entry in entries {
            let id = entry.identity();
            if id.is_empty() || inner.discarded.contains_key(&id) || inner.items.contains_key(&id)
            {
                continue;
            }
            let state: Arc<dyn ProxyState> = match &self.redis {
                Some(conn) => Arc::new(RedisState::new(conn.clone(), &self.cfg.namespace, &id)),
                None => Arc::new(LocalState::default()),
            };
            let item = Arc::new(ProxyItem::new(entry, self.item_cfg.clone(), state));
            if let Some(ts) = inner.probe_memory.get(&id) {
                item.seed_probe_ts(*ts);
            }
            inner.items.insert(id, item.clone());
            inner.queue.push_back(item);
            admitted += 1;
        }
        admitted
    }

    /// Externally mark endpoints delayed or discarded, e.g. by a downloader
    /// that watched a fetch fail through a specific proxy. Discarding evicts
    /// from the lookup table immediately and blocks re-admission for the
    /// rolling discard window.
    pub async fn tag(
        &self,
        entries: &[ProxyEntry],
        flag: HealthFlag,
        delay: Option<Duration>,
    ) -> bool {
        if entries.is_empty() {
            return false;
        }
        for entry in entries {
            let id = entry.identity();
            let item = self.inner.lock().await.items.get(&id).cloned();
            let Some(item) = item else { continue };
            item.state().set_flag(flag).await;
            item.state().set_flag_ts(now_ts()).await;
            if let Some(d) = delay {
                item.set_delay(d);
            }
            if flag == HealthFlag::Discarded {
                self.retire(&item, RetireReason::Discarded).await;
            }
        }
        true
    }

    /// Refill the pool from its source.
    ///
    /// Rate-limited by the minimum reset interval unless `force`, emptiness
    /// or a run of hand-out failures overrides it. Contending callers skip
    /// instead of blocking and proceed with whatever the pool already holds.
    pub async fn reset(&self, force: bool) {
        let _guard = match self.reset_guard.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("refill already in progress");
                return;
            }
        };
        let qsize = self.inner.lock().await.queue.len();
        let real_max = self.real_max.load(Ordering::Relaxed);
        let target_half = if self.cfg.capacity > 0 {
            (self.cfg.capacity as usize).min(real_max) / 2
        } else {
            real_max / 2
        };
        let last_reset = *self.last_reset.lock();
        // Emptiness stands on its own: target_half can round to zero after
        // a tiny source result, and an empty queue must still refill.
        let should = force
            || last_reset.is_none()
            || qsize == 0
            || qsize < target_half
            || self.no_valid_times.load(Ordering::Relaxed) >= 5;
        if !should {
            return;
        }
        if let Some(at) = last_reset {
            if at.elapsed() < self.cfg.reset_interval {
                let n = self.reset_fast_count.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 10 == 0 {
                    debug!(count = n, "proxy pool resetting too fast");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                return;
            }
        }
        match &self.redis {
            Some(conn) => {
                // Cross-process guard: whoever loses simply skips this round
                // and keeps serving its current working set.
                let store: Arc<dyn LockStore> = Arc::new(RedisStore::new(conn.clone()));
                let name = format!("{}:proxy_pool_reset", self.cfg.namespace);
                let lock_cfg = LockConfig {
                    ttl: 60,
                    wait_timeout: 5,
                    poll_interval: Some(Duration::from_secs(1)),
                };
                match RedisLock::new(&name, store, lock_cfg) {
                    Ok(mut lock) => match lock.acquire().await {
                        Ok(true) => {
                            self.refill().await;
                            if let Err(e) = lock.release(false).await {
                                warn!(error = %e, "reset lock release failed");
                            }
                        }
                        Ok(false) => debug!("another process holds the reset lock"),
                        Err(e) => {
                            warn!(error = %e, "reset lock unavailable, refilling anyway");
                            self.refill().await;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "reset lock construction failed");
                        self.refill().await;
                    }
                }
            }
            None => self.refill().await,
        }
    }

    /// Opportunistic refill check plus dequeue of the next candidate.
    async fn next_item(&self) -> Option<Arc<ProxyItem>> {
        if rand::random::<f64>() < self.cfg.refill_probability {
            let overdue = match *self.last_reset.lock() {
                Some(at) => at.elapsed() > self.cfg.reset_interval_max,
                None => true,
            };
            if overdue {
                self.reset(true).await;
            } else {
                let qsize = self.inner.lock().await.queue.len();
                let real_max = self.real_max.load(Ordering::Relaxed);
                let low_water = if self.cfg.capacity > 0 {
                    (self.cfg.capacity as usize).min(real_max) / 2
                } else {
                    real_max / 2
                };
                if qsize < low_water {
                    self.reset(false).await;
                }
            }
        }
        self.inner.lock().await.queue.pop_front()
    }

    async fn requeue(&self, item: Arc<ProxyItem>) {
        self.inner.lock().await.queue.push_back(item);
    }

    async fn retire(&self, item: &Arc<ProxyItem>, reason: RetireReason) {
        let mut inner = self.inner.lock().await;
        inner.items.remove(item.identity());
        inner
            .discarded
            .insert(item.identity().to_string(), Instant::now());
        debug!(identity = %item.identity(), ?reason, "proxy retired");
    }

    /// Pull a fresh list from the source and rebuild the working set.
    async fn refill(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.queue.clear();
            inner.items.clear();
            inner.discarded.retain(|_, at| at.elapsed() < DISCARD_WINDOW);
            let ts_cutoff = now_ts() - DISCARD_WINDOW.as_secs_f64();
            inner.probe_memory.retain(|_, ts| *ts > ts_cutoff);
        }
        let mut list = match self.source.fetch().await {
            Ok(list) => list,
            Err(e) => {
                // last_reset stays untouched so the next get retries.
                warn!(error = %e, "proxy source fetch failed");
                return;
            }
        };
        self.real_max.store(list.len().max(1), Ordering::Relaxed);
        if self.cfg.capacity > 0 && list.len() > self.cfg.capacity as usize {
            // The source already shuffles, so truncation is a random sample.
            list.truncate(self.cfg.capacity as usize);
        }
        let fetched = list.len();
        let admitted = self.append(list).await;
        *self.last_reset.lock() = Some(Instant::now());
        self.no_valid_times.store(0, Ordering::Relaxed);
        let inner = self.inner.lock().await;
        debug!(
            fetched,
            admitted,
            tracked = inner.items.len(),
            blocked = inner.discarded.len(),
            "proxy pool reset"
        );
    }
}
