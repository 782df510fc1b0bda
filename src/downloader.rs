//! The fetch collaborator
//!
//! The engine never talks to the network directly; it hands each request to
//! a [`Downloader`]. [`HttpDownloader`] is the production implementation:
//! plain reqwest, optionally routed through a [`ProxyPool`] hand-out, with
//! failures reported back to the pool as health tags. Tests substitute their
//! own implementations at the same seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::engine::Request;
use crate::pool::ProxyPool;
use crate::proxy::HealthFlag;

/// Errors surfaced by a fetch attempt. The engine treats any of these as
/// transient and re-enqueues the request against its retry budget.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http client construction failed: {0}")]
    Client(#[from] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failure in a custom downloader implementation.
    #[error("fetch failed: {0}")]
    Other(String),
}

/// Raw fetch result handed to the spider callback.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Seam between the engine and the network.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<RawResponse, FetchError>;
}

/// HTTP downloader with optional proxy-pool routing.
///
/// A client is built per request when a proxy is in play, because reqwest
/// fixes the proxy at client construction. Fetch failures through a proxy
/// bench that proxy so the pool stops handing it out for a while.
pub struct HttpDownloader {
    pool: Option<Arc<ProxyPool>>,
    timeout: Duration,
    user_agent: String,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            pool: None,
            timeout: Duration::from_secs(60),
            user_agent: concat!("crawlpool/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, request: &Request) -> Result<RawResponse, FetchError> {
        let proxy_entry = match &self.pool {
            Some(pool) => pool.get().await,
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent);
        if let Some(entry) = &proxy_entry {
            if let Some(url) = entry.any_url() {
                builder = builder.proxy(reqwest::Proxy::all(url)?);
            }
        }
        let client = builder.build()?;

        let req = match &request.payload {
            Some(body) => client.post(&request.url).body(body.clone()),
            None => client.get(&request.url),
        };
        match req.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.map_err(|source| FetchError::Request {
                    url: request.url.clone(),
                    source,
                })?;
                Ok(RawResponse {
                    url: request.url.clone(),
                    status,
                    body,
                })
            }
            Err(source) => {
                if let (Some(pool), Some(entry)) = (&self.pool, &proxy_entry) {
                    debug!(identity = %entry.identity(), "benching proxy after failed fetch");
                    pool.tag(std::slice::from_ref(entry), HealthFlag::Delayed, None)
                        .await;
                }
                Err(FetchError::Request {
                    url: request.url.clone(),
                    source,
                })
            }
        }
    }
}
