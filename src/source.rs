//! Proxy list origins
//!
//! A [`ProxySource`] turns origin descriptors into a list of candidate
//! [`ProxyEntry`] values. Three origins are supported: a newline-delimited
//! text file served over HTTP (cached to a local file), a local file, and a
//! redis sorted set holding `ip:port` members.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::seq::SliceRandom;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::endpoint::ProxyEntry;

/// Errors raised while fetching a proxy list.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no proxy origins configured")]
    NoOrigins,

    #[error("redis origin requires a configured sorted-set key")]
    MissingRedisKey,

    #[error("failed to fetch proxy list from {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read proxy cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("redis proxy origin failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One backing origin for candidate proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOrigin {
    /// HTTP(S) URL returning newline-delimited `ip:port[:protocol]` entries.
    Http(String),
    /// Local file in the same format.
    File(PathBuf),
    /// Redis sorted set whose members are `ip:port` strings.
    RedisZset { url: String, key: String },
}

impl ProxyOrigin {
    /// Classify a raw origin descriptor. Redis descriptors need the
    /// configured sorted-set key; anything that is not a URL is treated as a
    /// local file path.
    pub fn parse(raw: &str, redis_key: Option<&str>) -> Result<Self, SourceError> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(ProxyOrigin::Http(raw.to_string()))
        } else if raw.starts_with("redis://") || raw.starts_with("rediss://") {
            let key = redis_key.ok_or(SourceError::MissingRedisKey)?;
            Ok(ProxyOrigin::RedisZset {
                url: raw.to_string(),
                key: key.to_string(),
            })
        } else {
            Ok(ProxyOrigin::File(PathBuf::from(raw)))
        }
    }
}

/// Configuration for a [`ProxySource`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Raw origin descriptors, tried in order; results are concatenated.
    pub origins: Vec<String>,
    /// Sorted-set key for redis origins.
    pub redis_key: Option<String>,
    /// Directory holding cached copies of HTTP origins.
    pub cache_dir: PathBuf,
    /// Cache validity in seconds; <= 0 forces a re-fetch on every call.
    pub cache_timeout: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            origins: Vec::new(),
            redis_key: None,
            cache_dir: std::env::temp_dir().join("crawlpool_proxy_cache"),
            cache_timeout: 60,
        }
    }
}

/// Fetches candidate proxy lists from configured origins.
pub struct ProxySource {
    cfg: SourceConfig,
    http: reqwest::Client,
}

impl ProxySource {
    pub fn new(cfg: SourceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self { cfg, http }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.cfg
    }

    /// Pull a fresh candidate list from every configured origin.
    ///
    /// The combined list is shuffled so repeated refills do not always admit
    /// the same head of the source file.
    pub async fn fetch(&self) -> Result<Vec<ProxyEntry>, SourceError> {
        if self.cfg.origins.is_empty() {
            return Err(SourceError::NoOrigins);
        }
        let mut entries = Vec::new();
        for raw in &self.cfg.origins {
            let origin = ProxyOrigin::parse(raw, self.cfg.redis_key.as_deref())?;
            match origin {
                ProxyOrigin::Http(url) => entries.extend(self.fetch_http(&url).await?),
                ProxyOrigin::File(path) => entries.extend(Self::fetch_file(&path).await?),
                ProxyOrigin::RedisZset { url, key } => {
                    entries.extend(Self::fetch_redis(&url, &key).await?)
                }
            }
        }
        entries.shuffle(&mut rand::rng());
        Ok(entries)
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<ProxyEntry>, SourceError> {
        let filename = url.rsplit('/').next().unwrap_or("proxies.txt");
        let cache_path = self.cfg.cache_dir.join(filename);
        if !self.cache_is_fresh(&cache_path).await {
            match self.download(url).await {
                Ok(body) => {
                    if let Err(e) = tokio::fs::create_dir_all(&self.cfg.cache_dir).await {
                        warn!(dir = %self.cfg.cache_dir.display(), error = %e, "cache dir create failed");
                    } else if let Err(e) = tokio::fs::write(&cache_path, &body).await {
                        warn!(path = %cache_path.display(), error = %e, "cache write failed");
                    }
                    return Ok(Self::parse_text(&body));
                }
                Err(e) => {
                    // A stale cache beats no proxies at all.
                    if cache_path.exists() {
                        warn!(url, error = %e, "proxy fetch failed, using stale cache");
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Self::fetch_file(&cache_path).await
    }

    async fn cache_is_fresh(&self, path: &Path) -> bool {
        if self.cfg.cache_timeout <= 0 {
            return false;
        }
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        match meta.modified().ok().and_then(|m| m.elapsed().ok()) {
            Some(age) => age.as_secs() <= self.cfg.cache_timeout as u64,
            None => false,
        }
    }

    async fn download(&self, url: &str) -> Result<String, SourceError> {
        let map_err = |source| SourceError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.http.get(url).send().await.map_err(map_err)?;
        let body = response.text().await.map_err(map_err)?;
        debug!(url, bytes = body.len(), "fetched proxy list");
        Ok(body)
    }

    async fn fetch_file(path: &Path) -> Result<Vec<ProxyEntry>, SourceError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::parse_text(&text))
    }

    async fn fetch_redis(url: &str, key: &str) -> Result<Vec<ProxyEntry>, SourceError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let members: Vec<String> = conn.zrange(key, 0, -1).await?;
        Ok(members.iter().map(|m| ProxyEntry::from_id(m)).collect())
    }

    /// Parse a newline-delimited proxy list, skipping blanks and comments.
    pub fn parse_text(text: &str) -> Vec<ProxyEntry> {
        text.lines().filter_map(ProxyEntry::from_line).collect()
    }
}
