//! Batch-oriented crawling engine with proxy lifecycle management and
//! cross-process coordination.
//!
//! Three subsystems, usable together or on their own:
//! - [`ProxyPool`]: tracks upstream proxy health, refills from configurable
//!   origins and retires endpoints that go bad.
//! - [`TaskEngine`]: a bounded producer/consumer pipeline running a
//!   [`Spider`] over a fixed worker pool, with retry budgets, backpressure
//!   and a memory watchdog.
//! - [`RedisLock`]: a named TTL lock for coordinating crawler processes.

// Core modules
pub mod downloader;
pub mod endpoint;
pub mod engine;
pub mod lock;
pub mod memory;
pub mod pool;
mod proxy;
mod queue;
pub mod source;
pub mod storage;

// Public exports
pub use downloader::{Downloader, FetchError, HttpDownloader, RawResponse};
pub use endpoint::ProxyEntry;
pub use engine::{
    CloseReason, ConfigError, CrawlReport, CrawlStats, EngineError, ParseOutput, Request,
    Response, Spider, StatsTracker, TaskEngine, TaskEngineBuilder, OOM_EXIT_CODE,
};
pub use lock::{LockConfig, LockError, LockStore, MemoryStore, RedisLock, RedisStore};
pub use memory::{FixedProbe, MemoryProbe, SysinfoProbe};
pub use pool::{PoolConfig, ProxyPool};
pub use proxy::{
    HealthFlag, LocalState, ProbeKind, ProxyItem, ProxyItemConfig, ProxyState, RedisState,
    RetireReason, Validity,
};
pub use queue::{DeadLetterSink, TaskQueue};
pub use source::{ProxyOrigin, ProxySource, SourceConfig, SourceError};
pub use storage::{NullStorage, Row, Storage};
