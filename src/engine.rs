//! The batch task engine
//!
//! A producer/consumer pipeline: the spider's request iterator feeds a
//! shared [`TaskQueue`], a fixed pool of worker tasks drains it through the
//! [`Downloader`] seam, and callback output flows back in as follow-up
//! requests or out through the [`Storage`] seam. The producer throttles
//! itself against queue depth, polls the spider's break predicate, and
//! watches process memory so a leaking run terminates itself instead of
//! being killed blindly by the OS.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::{Downloader, RawResponse};
use crate::memory::{MemoryProbe, SysinfoProbe};
use crate::queue::{DeadLetterSink, TaskQueue};
use crate::storage::{Row, Storage};

/// Conventional exit status for an out-of-memory kill; embedding processes
/// exit with [`CrawlReport::exit_code`] so supervisors see the same status
/// the OOM killer would have produced.
pub const OOM_EXIT_CODE: i32 = 137;

/// Configuration rejected at build time.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("worker pool size must be at least 1, got {0}")]
    InvalidPoolSize(usize),

    #[error("memory limit must be within (0, 1], got {0}")]
    InvalidMemoryLimit(f64),

    #[error("proxy pool capacity must be positive or -1 for unbounded, got {0}")]
    InvalidPoolCapacity(i64),

    #[error("refill probability must be within [0, 1], got {0}")]
    InvalidRefillProbability(f64),

    #[error("a downloader is required")]
    MissingDownloader,
}

/// Errors that abort a crawl.
///
/// Worker-level failures (fetch errors, callback panics caught as errors)
/// are retried or logged, never surfaced here; only the producer and the
/// start hook can fail the run as a whole.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("before_start hook failed: {0}")]
    BeforeStart(#[source] anyhow::Error),

    #[error("request producer failed: {0}")]
    Producer(#[source] anyhow::Error),
}

/// One unit of crawl work.
///
/// `retry` counts executions so far; the engine increments it on dequeue and
/// drops the request once the count exceeds the configured budget. A request
/// may carry its own downloader to bypass the engine-wide one, e.g. for a
/// handful of URLs needing a different proxy posture.
#[derive(Clone)]
pub struct Request {
    pub url: String,
    /// POST body; `None` fetches with GET.
    pub payload: Option<String>,
    /// Callback routing key for [`Spider::dispatch`].
    pub callback: Option<String>,
    /// Opaque task context carried through to the callback.
    pub context: serde_json::Value,
    pub retry: u32,
    pub downloader: Option<Arc<dyn Downloader>>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: None,
            callback: None,
            context: serde_json::Value::Null,
            retry: 0,
            downloader: None,
        }
    }

    pub fn post(url: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut request = Self::get(url);
        request.payload = Some(payload.into());
        request
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("callback", &self.callback)
            .field("retry", &self.retry)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Fetch result delivered to the spider callback. Either `raw` or `error`
/// is set, never both.
///
/// When `error` is set the engine has already requeued the request against
/// its retry budget; the callback sees the failure for reporting, not for
/// scheduling.
#[derive(Debug, Clone)]
pub struct Response {
    pub request: Request,
    pub raw: Option<RawResponse>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> Option<u16> {
        self.raw.as_ref().map(|r| r.status)
    }

    /// Response body, empty when the fetch failed.
    pub fn text(&self) -> &str {
        self.raw.as_ref().map(|r| r.body.as_str()).unwrap_or("")
    }
}

/// What a callback produced: follow-up requests fed back into the queue and
/// rows forwarded to storage.
#[derive(Default)]
pub struct ParseOutput {
    pub requests: Vec<Request>,
    pub rows: Vec<Row>,
    /// Destination table for `rows`; falls back to the spider name.
    pub table: Option<String>,
}

impl ParseOutput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn follow(requests: Vec<Request>) -> Self {
        Self {
            requests,
            ..Self::default()
        }
    }

    pub fn store(rows: Vec<Row>, table: impl Into<String>) -> Self {
        Self {
            rows,
            table: Some(table.into()),
            ..Self::default()
        }
    }
}

/// A crawl definition: where requests come from and what to do with each
/// response.
#[async_trait]
pub trait Spider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Seed request stream. Lazy by contract: the engine pulls the next item
    /// only when the queue has room, so an effectively-infinite generator is
    /// fine. An `Err` item aborts production; already-queued work still
    /// drains before the error is surfaced from the run.
    fn start_requests(&self) -> Box<dyn Iterator<Item = anyhow::Result<Request>> + Send>;

    /// Default callback.
    ///
    /// Do not re-enqueue a request whose fetch failed (`response.error`
    /// set): the engine retries those itself, and a callback-side requeue
    /// would duplicate the task.
    async fn parse(&self, response: Response) -> anyhow::Result<ParseOutput>;

    /// Route a response to its callback. The default ignores the routing key
    /// and calls [`parse`](Spider::parse); spiders with several callbacks
    /// match on `response.request.callback`.
    async fn dispatch(&self, response: Response) -> anyhow::Result<ParseOutput> {
        self.parse(response).await
    }

    /// Polled periodically while the crawl runs; returning true stops it.
    async fn break_spider(&self) -> bool {
        false
    }

    async fn before_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why a crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Producer exhausted and all queued work drained.
    Finished,
    /// The spider's break predicate fired.
    BreakSpider,
    /// Memory utilization crossed the configured limit.
    Killed,
}

/// Final accounting of one crawl.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub close_reason: CloseReason,
    pub stats: CrawlStats,
}

impl CrawlReport {
    pub fn oom_killed(&self) -> bool {
        self.close_reason == CloseReason::Killed
    }

    /// Status for the embedding process to exit with: 137 after a memory
    /// kill so supervisors treat it exactly like an OS-level OOM kill.
    pub fn exit_code(&self) -> i32 {
        if self.oom_killed() {
            OOM_EXIT_CODE
        } else {
            0
        }
    }
}

/// Point-in-time crawl counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CrawlStats {
    pub enqueued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
    pub dead_lettered: usize,
    pub finished: bool,
}

/// Lock-free counters with a watch broadcast, so embedding code can observe
/// progress live without polling the engine.
pub struct StatsTracker {
    enqueued: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    dropped: AtomicUsize,
    dead_lettered: AtomicUsize,
    finished: AtomicBool,
    tx: watch::Sender<CrawlStats>,
}

impl StatsTracker {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(CrawlStats::default());
        Self {
            enqueued: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            dead_lettered: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CrawlStats> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> CrawlStats {
        CrawlStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
        }
    }

    fn broadcast(&self) {
        let _ = self.tx.send(self.snapshot());
    }

    fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    fn close(&self) {
        self.finished.store(true, Ordering::Relaxed);
        self.broadcast();
    }
}

#[derive(Debug, Clone)]
struct EngineConfig {
    pool_size: usize,
    high_water: Option<usize>,
    max_retries: u32,
    memory_limit: f64,
    break_check_interval: Duration,
    memory_check_interval: Duration,
    dequeue_timeout: Duration,
    idle_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 100,
            high_water: None,
            max_retries: 9999,
            memory_limit: 0.8,
            break_check_interval: Duration::from_secs(5),
            memory_check_interval: Duration::from_secs(60),
            dequeue_timeout: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Builder for [`TaskEngine`]; a downloader is the one required piece.
pub struct TaskEngineBuilder {
    cfg: EngineConfig,
    downloader: Option<Arc<dyn Downloader>>,
    storage: Option<Arc<dyn Storage>>,
    memory: Option<Arc<dyn MemoryProbe>>,
    dead_letter: Option<DeadLetterSink>,
}

impl TaskEngineBuilder {
    fn new() -> Self {
        Self {
            cfg: EngineConfig::default(),
            downloader: None,
            storage: None,
            memory: None,
            dead_letter: None,
        }
    }

    /// Number of concurrent worker tasks.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.cfg.pool_size = pool_size;
        self
    }

    /// Queue depth at which the producer throttles itself. Defaults to
    /// `min(100, pool_size)`.
    pub fn high_water(mut self, high_water: usize) -> Self {
        self.cfg.high_water = Some(high_water);
        self
    }

    /// Executions allowed per request before it is dropped.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.cfg.max_retries = max_retries;
        self
    }

    /// Memory utilization fraction above which the crawl kills itself.
    pub fn memory_limit(mut self, memory_limit: f64) -> Self {
        self.cfg.memory_limit = memory_limit;
        self
    }

    pub fn break_check_interval(mut self, interval: Duration) -> Self {
        self.cfg.break_check_interval = interval;
        self
    }

    pub fn memory_check_interval(mut self, interval: Duration) -> Self {
        self.cfg.memory_check_interval = interval;
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.dequeue_timeout = timeout;
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the system memory probe, e.g. with a fixed reading in tests.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = Some(probe);
        self
    }

    /// Receive requests that exceeded their retry budget instead of
    /// silently dropping them. The retry counter is reset before hand-over.
    pub fn dead_letter(mut self, sink: DeadLetterSink) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn build(self) -> Result<TaskEngine, ConfigError> {
        if self.cfg.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.cfg.pool_size));
        }
        if !(self.cfg.memory_limit > 0.0 && self.cfg.memory_limit <= 1.0) {
            return Err(ConfigError::InvalidMemoryLimit(self.cfg.memory_limit));
        }
        let downloader = self.downloader.ok_or(ConfigError::MissingDownloader)?;
        let mut queue = TaskQueue::new();
        if let Some(sink) = self.dead_letter {
            queue = queue.with_dead_letter(sink);
        }
        Ok(TaskEngine {
            shared: Arc::new(Shared {
                cfg: self.cfg,
                queue,
                stats: StatsTracker::new(),
                downloader,
                storage: self.storage,
                memory: self
                    .memory
                    .unwrap_or_else(|| Arc::new(SysinfoProbe::new())),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

/// State shared between the producer and the worker pool.
struct Shared {
    cfg: EngineConfig,
    queue: TaskQueue,
    stats: StatsTracker,
    downloader: Arc<dyn Downloader>,
    storage: Option<Arc<dyn Storage>>,
    memory: Arc<dyn MemoryProbe>,
    cancel: CancellationToken,
}

/// The crawl pipeline. Build one per run.
pub struct TaskEngine {
    shared: Arc<Shared>,
}

impl TaskEngine {
    pub fn builder() -> TaskEngineBuilder {
        TaskEngineBuilder::new()
    }

    pub fn stats(&self) -> watch::Receiver<CrawlStats> {
        self.shared.stats.subscribe()
    }

    /// Run the spider to completion.
    ///
    /// Returns the crawl report, or the producer's error after all teardown
    /// (workers joined, stop hook run) has completed.
    pub async fn run<S: Spider>(self, spider: Arc<S>) -> Result<CrawlReport, EngineError> {
        let shared = self.shared;
        info!(spider = spider.name(), workers = shared.cfg.pool_size, "crawl starting");
        spider
            .before_start()
            .await
            .map_err(EngineError::BeforeStart)?;

        let busy: Arc<Vec<AtomicBool>> = Arc::new(
            (0..shared.cfg.pool_size)
                .map(|_| AtomicBool::new(false))
                .collect(),
        );
        let handles: Vec<_> = (0..shared.cfg.pool_size)
            .map(|idx| {
                tokio::spawn(worker_loop(
                    shared.clone(),
                    spider.clone(),
                    busy.clone(),
                    idx,
                ))
            })
            .collect();

        // The producer throttles against this depth; workers re-enqueueing
        // follow-ups are exempt so they can never wedge against a full queue.
        let high_water = shared
            .cfg
            .high_water
            .unwrap_or_else(|| shared.cfg.pool_size.min(100))
            .max(1);
        let mut close_reason = CloseReason::Finished;
        let mut producer_error: Option<anyhow::Error> = None;
        let mut last_break_check: Option<Instant> = None;
        let mut last_memory_check: Option<Instant> = None;

        'produce: for item in spider.start_requests() {
            let request = match item {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "request producer failed");
                    producer_error = Some(e);
                    break 'produce;
                }
            };
            if let Some(reason) = due_checks(
                &shared,
                spider.as_ref(),
                &mut last_break_check,
                &mut last_memory_check,
            )
            .await
            {
                close_reason = reason;
                break 'produce;
            }
            let mut backoff_step = 0u32;
            while shared.queue.len() >= high_water {
                if let Some(reason) = due_checks(
                    &shared,
                    spider.as_ref(),
                    &mut last_break_check,
                    &mut last_memory_check,
                )
                .await
                {
                    close_reason = reason;
                    break 'produce;
                }
                backoff_step += 1;
                let delay = (0.1 * f64::from(backoff_step)).min(3.0);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            shared.stats.record_enqueued();
            shared.queue.push(request);
        }

        // Break and memory kills only halt production; queued work drains
        // for every close reason before teardown. The checks keep running
        // while the crawl is still nominally healthy so a drain extended by
        // follow-up requests stays interruptible.
        loop {
            let idle = shared.queue.is_empty() && all_idle(&busy);
            if idle {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if shared.queue.is_empty() && all_idle(&busy) {
                    break;
                }
                continue;
            }
            if close_reason == CloseReason::Finished {
                if let Some(reason) = due_checks(
                    &shared,
                    spider.as_ref(),
                    &mut last_break_check,
                    &mut last_memory_check,
                )
                .await
                {
                    close_reason = reason;
                }
            }
            tokio::time::sleep(shared.cfg.idle_poll_interval).await;
        }

        shared.cancel.cancel();
        join_all(handles).await;
        if let Err(e) = spider.before_stop().await {
            error!(error = %e, "before_stop hook failed");
        }
        shared.stats.close();

        if let Some(e) = producer_error {
            return Err(EngineError::Producer(e));
        }
        let report = CrawlReport {
            close_reason,
            stats: shared.stats.snapshot(),
        };
        info!(
            spider = spider.name(),
            reason = ?report.close_reason,
            stats = ?report.stats,
            "crawl finished"
        );
        Ok(report)
    }
}

fn all_idle(busy: &[AtomicBool]) -> bool {
    busy.iter().all(|b| !b.load(Ordering::Relaxed))
}

/// Run the break predicate and the memory watchdog when their intervals are
/// due. Both are rate-limited independently; the memory reading in
/// particular is checked at most once per interval because a sysinfo refresh
/// is not free.
async fn due_checks<S: Spider>(
    shared: &Shared,
    spider: &S,
    last_break: &mut Option<Instant>,
    last_memory: &mut Option<Instant>,
) -> Option<CloseReason> {
    let break_due = last_break.map_or(true, |t| t.elapsed() >= shared.cfg.break_check_interval);
    if break_due {
        *last_break = Some(Instant::now());
        if spider.break_spider().await {
            warn!("break predicate fired, stopping crawl");
            return Some(CloseReason::BreakSpider);
        }
    }
    let memory_due =
        last_memory.map_or(true, |t| t.elapsed() >= shared.cfg.memory_check_interval);
    if memory_due {
        *last_memory = Some(Instant::now());
        let used = shared.memory.utilization();
        if used > shared.cfg.memory_limit {
            warn!(
                utilization = used,
                limit = shared.cfg.memory_limit,
                "memory limit breached, killing crawl"
            );
            return Some(CloseReason::Killed);
        }
    }
    None
}

async fn worker_loop<S: Spider>(
    shared: Arc<Shared>,
    spider: Arc<S>,
    busy: Arc<Vec<AtomicBool>>,
    idx: usize,
) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let request = shared.queue.pop_timeout(shared.cfg.dequeue_timeout).await;
        let Some(mut request) = request else {
            busy[idx].store(false, Ordering::Relaxed);
            continue;
        };
        busy[idx].store(true, Ordering::Relaxed);

        if request.retry > shared.cfg.max_retries {
            if shared.queue.dead_letter(request) {
                shared.stats.record_dead_lettered();
            } else {
                warn!(retries = shared.cfg.max_retries, "dropping over-retried request");
                shared.stats.record_dropped();
            }
            busy[idx].store(false, Ordering::Relaxed);
            continue;
        }
        request.retry += 1;

        let downloader = request
            .downloader
            .clone()
            .unwrap_or_else(|| shared.downloader.clone());
        let (response, fetched) = match downloader.fetch(&request).await {
            Ok(raw) => (
                Response {
                    request: request.clone(),
                    raw: Some(raw),
                    error: None,
                },
                true,
            ),
            Err(e) => {
                debug!(url = %request.url, retry = request.retry, error = %e, "fetch failed, requeueing");
                let response = Response {
                    request: request.clone(),
                    raw: None,
                    error: Some(e.to_string()),
                };
                // Fetch errors are transient by assumption; the request goes
                // back with its incremented counter and the callback still
                // sees the error response.
                shared.stats.record_failed();
                shared.queue.push(request);
                (response, false)
            }
        };

        let spider_name = spider.name().to_string();
        match spider.dispatch(response).await {
            Ok(output) => {
                if fetched {
                    shared.stats.record_succeeded();
                }
                sink_output(&shared, &spider_name, output).await;
            }
            Err(e) => {
                // Callback failures are bugs in parsing logic, not transient
                // conditions; log and move on rather than retry.
                error!(error = %e, "callback failed");
                if fetched {
                    shared.stats.record_failed();
                }
            }
        }
        busy[idx].store(false, Ordering::Relaxed);
    }
}

async fn sink_output(shared: &Shared, spider_name: &str, output: ParseOutput) {
    for request in output.requests {
        shared.stats.record_enqueued();
        shared.queue.push(request);
    }
    if output.rows.is_empty() {
        return;
    }
    let table = output.table.as_deref().unwrap_or(spider_name);
    match &shared.storage {
        Some(storage) => {
            if let Err(e) = storage.insert(&output.rows, table).await {
                error!(table, error = %e, "storage insert failed");
            }
        }
        None => debug!(rows = output.rows.len(), "no storage configured, dropping rows"),
    }
}
