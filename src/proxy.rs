//! Proxy health state and validity checking
//!
//! A [`ProxyItem`] wraps one [`ProxyEntry`] with its health/usage lifecycle.
//! The mutable flags live behind the [`ProxyState`] seam with two
//! implementations: in-memory state owned by one process, and state mirrored
//! in redis hashes so multiple processes agree on a proxy's flags. The
//! implementation is selected by pool configuration at construction, never
//! swapped at runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::endpoint::ProxyEntry;

/// Seconds since the unix epoch, fractional.
pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Health flag of a tracked proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFlag {
    /// Healthy, eligible for hand-out.
    Active,
    /// Temporarily benched; eligible again once its delay elapses.
    Delayed,
    /// Permanently retired; evicted from the pool.
    Discarded,
}

impl HealthFlag {
    pub fn as_i8(self) -> i8 {
        match self {
            HealthFlag::Active => 0,
            HealthFlag::Delayed => 1,
            HealthFlag::Discarded => -1,
        }
    }

    pub fn from_i8(v: i8) -> Self {
        match v {
            1 => HealthFlag::Delayed,
            -1 => HealthFlag::Discarded,
            _ => HealthFlag::Active,
        }
    }
}

/// Why a proxy left the pool.
///
/// Both reasons remove the item identically, but callers observing logs or
/// validity results can tell a permanently bad endpoint from one that merely
/// ran out of its use budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Failed a validity check or was externally tagged bad.
    Discarded,
    /// Hit its configured maximum use count.
    Exhausted,
}

/// Outcome of a validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Usable. `probed` is true when an actual network probe ran, as opposed
    /// to trusting a recent check.
    Valid { probed: bool },
    /// Not usable right now; try another item and come back later.
    Delay,
    /// Drop from the pool.
    Invalid(RetireReason),
}

/// Mutable per-proxy flags, either process-local or mirrored in a shared
/// store.
#[async_trait]
pub trait ProxyState: Send + Sync {
    async fn flag(&self) -> HealthFlag;
    async fn set_flag(&self, flag: HealthFlag);
    async fn flag_ts(&self) -> f64;
    async fn set_flag_ts(&self, ts: f64);
    async fn use_ts(&self) -> f64;
    async fn set_use_ts(&self, ts: f64);
}

/// In-memory proxy state owned by exactly one pool.
#[derive(Default)]
pub struct LocalState {
    inner: Mutex<LocalStateInner>,
}

#[derive(Default)]
struct LocalStateInner {
    flag: i8,
    flag_ts: f64,
    use_ts: f64,
}

#[async_trait]
impl ProxyState for LocalState {
    async fn flag(&self) -> HealthFlag {
        HealthFlag::from_i8(self.inner.lock().flag)
    }

    async fn set_flag(&self, flag: HealthFlag) {
        self.inner.lock().flag = flag.as_i8();
    }

    async fn flag_ts(&self) -> f64 {
        self.inner.lock().flag_ts
    }

    async fn set_flag_ts(&self, ts: f64) {
        self.inner.lock().flag_ts = ts;
    }

    async fn use_ts(&self) -> f64 {
        self.inner.lock().use_ts
    }

    async fn set_use_ts(&self, ts: f64) {
        self.inner.lock().use_ts = ts;
    }
}

/// Proxy state mirrored in redis hashes under a shared namespace, so several
/// crawler processes agree on each proxy's flags.
///
/// Layout: `{ns}:proxy_flag`, `{ns}:proxy_flag_ts` and `{ns}:proxy_use_time`
/// are hashes keyed by proxy identity. Store errors are logged and read as
/// the zero value; a proxy that cannot be read is treated as active rather
/// than wedging the hand-out path.
pub struct RedisState {
    conn: MultiplexedConnection,
    identity: String,
    flag_key: String,
    flag_ts_key: String,
    use_time_key: String,
}

impl RedisState {
    pub fn new(conn: MultiplexedConnection, namespace: &str, identity: &str) -> Self {
        Self {
            conn,
            identity: identity.to_string(),
            flag_key: format!("{}:proxy_flag", namespace),
            flag_ts_key: format!("{}:proxy_flag_ts", namespace),
            use_time_key: format!("{}:proxy_use_time", namespace),
        }
    }

    async fn hget_f64(&self, key: &str) -> f64 {
        let mut conn = self.conn.clone();
        match conn.hget::<_, _, Option<String>>(key, &self.identity).await {
            Ok(v) => v.and_then(|s| s.parse().ok()).unwrap_or(0.0),
            Err(e) => {
                warn!(key, identity = %self.identity, error = %e, "proxy state read failed");
                0.0
            }
        }
    }

    async fn hset_f64(&self, key: &str, value: f64) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.hset::<_, _, _, ()>(key, &self.identity, value).await {
            warn!(key, identity = %self.identity, error = %e, "proxy state write failed");
        }
    }
}

#[async_trait]
impl ProxyState for RedisState {
    async fn flag(&self) -> HealthFlag {
        let mut conn = self.conn.clone();
        match conn
            .hget::<_, _, Option<i64>>(&self.flag_key, &self.identity)
            .await
        {
            Ok(v) => HealthFlag::from_i8(v.unwrap_or(0) as i8),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "proxy flag read failed");
                HealthFlag::Active
            }
        }
    }

    async fn set_flag(&self, flag: HealthFlag) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .hset::<_, _, _, ()>(&self.flag_key, &self.identity, flag.as_i8() as i64)
            .await
        {
            warn!(identity = %self.identity, error = %e, "proxy flag write failed");
        }
    }

    async fn flag_ts(&self) -> f64 {
        self.hget_f64(&self.flag_ts_key).await
    }

    async fn set_flag_ts(&self, ts: f64) {
        self.hset_f64(&self.flag_ts_key, ts).await;
    }

    async fn use_ts(&self) -> f64 {
        self.hget_f64(&self.use_time_key).await
    }

    async fn set_use_ts(&self, ts: f64) {
        self.hset_f64(&self.use_time_key, ts).await;
    }
}

/// How the validity check probes an endpoint.
///
/// The TCP probe is cheap but has false positives: a connect can succeed
/// while application-level traffic is still rejected. The HTTP probe fetches
/// a known-good target through the proxy, which is authoritative but
/// expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp,
    Http,
}

/// Per-item health configuration, shared by every item in a pool.
#[derive(Debug, Clone)]
pub struct ProxyItemConfig {
    /// Probe timeout in seconds; 0 disables probing entirely.
    pub valid_timeout: u64,
    /// A check within this window of the last probe is trusted without
    /// reprobing.
    pub check_interval: Duration,
    /// Maximum hand-outs before the item counts as exhausted; 0 = unlimited.
    pub max_use: u64,
    /// Default bench duration for delayed items.
    pub delay: Duration,
    /// Minimum gap between two hand-outs of the same item.
    pub use_interval: Option<Duration>,
    pub probe: ProbeKind,
    /// Known-good target for the HTTP content probe.
    pub probe_target: String,
}

impl Default for ProxyItemConfig {
    fn default() -> Self {
        Self {
            valid_timeout: 20,
            check_interval: Duration::from_secs(180),
            max_use: 10_000,
            delay: Duration::from_secs(30),
            use_interval: None,
            probe: ProbeKind::Tcp,
            probe_target: "http://httpbin.org/ip".to_string(),
        }
    }
}

/// One tracked proxy: immutable entry + identity, mutable health state.
pub struct ProxyItem {
    entry: ProxyEntry,
    identity: String,
    cfg: Arc<ProxyItemConfig>,
    state: Arc<dyn ProxyState>,
    use_count: AtomicU64,
    /// Last actual probe, epoch seconds. Local even when the flags are
    /// redis-mirrored; reprobing per process is intentional.
    probe_ts: Mutex<f64>,
    delay_override: Mutex<Option<Duration>>,
}

impl ProxyItem {
    pub fn new(entry: ProxyEntry, cfg: Arc<ProxyItemConfig>, state: Arc<dyn ProxyState>) -> Self {
        let identity = entry.identity();
        Self {
            entry,
            identity,
            cfg,
            state,
            use_count: AtomicU64::new(0),
            probe_ts: Mutex::new(0.0),
            delay_override: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn entry(&self) -> &ProxyEntry {
        &self.entry
    }

    pub fn state(&self) -> &Arc<dyn ProxyState> {
        &self.state
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Record a hand-out: increments the use counter and returns the entry.
    pub fn checkout(&self) -> ProxyEntry {
        self.use_count.fetch_add(1, Ordering::Relaxed);
        self.entry.clone()
    }

    pub fn probe_ts(&self) -> f64 {
        *self.probe_ts.lock()
    }

    /// Seed the probe timestamp, e.g. from the pool's retained record after
    /// a refill, so a fast reset does not force a redundant reprobe.
    pub fn seed_probe_ts(&self, ts: f64) {
        *self.probe_ts.lock() = ts;
    }

    /// Override the bench duration for this item (set by external tagging).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay_override.lock() = Some(delay);
    }

    fn effective_delay(&self) -> Duration {
        self.delay_override.lock().unwrap_or(self.cfg.delay)
    }

    pub fn use_interval(&self) -> Option<Duration> {
        self.cfg.use_interval
    }

    /// Check whether this item may be handed out.
    ///
    /// `force` bypasses the trust window and always probes (when probing is
    /// enabled). The delayed flag self-resets to active once its bench time
    /// has elapsed.
    pub async fn is_valid(&self, force: bool) -> Validity {
        let now = now_ts();
        if self.cfg.max_use > 0 && self.use_count() >= self.cfg.max_use {
            debug!(identity = %self.identity, uses = self.use_count(), "proxy exhausted");
            return Validity::Invalid(RetireReason::Exhausted);
        }
        match self.state.flag().await {
            HealthFlag::Discarded => {
                debug!(identity = %self.identity, "proxy flagged discarded");
                return Validity::Invalid(RetireReason::Discarded);
            }
            HealthFlag::Delayed => {
                let benched = now - self.state.flag_ts().await;
                if benched < self.effective_delay().as_secs_f64() {
                    debug!(identity = %self.identity, benched, "proxy delayed");
                    return Validity::Delay;
                }
                self.state.set_flag(HealthFlag::Active).await;
                debug!(identity = %self.identity, "delayed proxy released");
            }
            HealthFlag::Active => {}
        }
        if let Some(interval) = self.cfg.use_interval {
            if now - self.state.use_ts().await < interval.as_secs_f64() {
                return Validity::Delay;
            }
        }
        if !force && now - self.probe_ts() < self.cfg.check_interval.as_secs_f64() {
            return Validity::Valid { probed: false };
        }
        if self.cfg.valid_timeout == 0 {
            *self.probe_ts.lock() = now;
            return Validity::Valid { probed: true };
        }
        let ok = self.probe().await;
        *self.probe_ts.lock() = now_ts();
        if ok {
            Validity::Valid { probed: true }
        } else {
            Validity::Invalid(RetireReason::Discarded)
        }
    }

    async fn probe(&self) -> bool {
        let timeout = Duration::from_secs(self.cfg.valid_timeout);
        match self.cfg.probe {
            ProbeKind::Tcp => self.probe_tcp(timeout).await,
            ProbeKind::Http => self.probe_http(timeout).await,
        }
    }

    async fn probe_tcp(&self, timeout: Duration) -> bool {
        let (host, port) = match (self.entry.host(), self.entry.port()) {
            (Some(h), Some(p)) => (h, p),
            _ => return false,
        };
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port)))
            .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(identity = %self.identity, error = %e, "tcp probe failed");
                false
            }
            Err(_) => {
                debug!(identity = %self.identity, "tcp probe timed out");
                false
            }
        }
    }

    async fn probe_http(&self, timeout: Duration) -> bool {
        let url = match self.entry.any_url() {
            Some(u) => u,
            None => return false,
        };
        let proxy = match reqwest::Proxy::all(url) {
            Ok(p) => p,
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "bad proxy url");
                return false;
            }
        };
        let client = match reqwest::Client::builder().proxy(proxy).timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "probe client build failed");
                return false;
            }
        };
        match client.get(&self.cfg.probe_target).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "http probe failed");
                false
            }
        }
    }
}
