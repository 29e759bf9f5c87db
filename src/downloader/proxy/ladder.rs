// Proxy Ladder - ordered fetch strategies with first-success caching
//
// Strategy order:
// 1. Direct request with spoofed headers (skipped for domains that block it)
// 2. Primary mirror proxy
// 3. Secondary mirror proxy
//
// Exactly one attempt per strategy. The first success is cached under the
// original URL so later resolutions within the TTL skip the ladder entirely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tracing::{debug, info, warn};

use super::{AttemptOutcome, DomainList, ProxyAttempt, ProxyEndpoint};
use crate::config::ProxyConfig;
use crate::downloader::cache::{CacheStore, CacheTable};
use crate::downloader::errors::{ProxyError, TransportError};
use crate::downloader::http::{HttpRequest, HttpTransport, SpoofHeaders};

/// One way of fetching a URL's content
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Name of the strategy (for logging)
    fn name(&self) -> &'static str;

    /// Whether this strategy should be tried for `url`
    fn applies_to(&self, _url: &Url) -> bool {
        true
    }

    /// URL actually requested for `url`
    fn target_for(&self, url: &Url) -> String {
        url.to_string()
    }

    /// Fetch the whole body; non-success statuses are errors
    async fn fetch(&self, url: &Url) -> Result<Bytes, ProxyError>;
}

async fn fetch_body(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    timeout: Duration,
) -> Result<Bytes, ProxyError> {
    let fetch = async {
        let response = transport.send(request).await?;
        if !response.status.is_success() {
            return Err(ProxyError::Status(response.status.as_u16()));
        }
        Ok(response.bytes().await?)
    };
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| ProxyError::Transport(TransportError::Timeout(format!("{}s", timeout.as_secs()))))?
}

/// Request the literal URL with pinned browser headers
pub struct DirectStrategy {
    transport: Arc<dyn HttpTransport>,
    headers: SpoofHeaders,
    blocked: DomainList,
    timeout: Duration,
}

impl DirectStrategy {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        headers: SpoofHeaders,
        blocked: DomainList,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            headers,
            blocked,
            timeout,
        }
    }
}

#[async_trait]
impl FetchStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn applies_to(&self, url: &Url) -> bool {
        !self.blocked.matches_url(url)
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes, ProxyError> {
        let request = HttpRequest::get(url.as_str())?
            .with_headers(&self.headers)
            .omit_credentials();
        fetch_body(self.transport.as_ref(), request, self.timeout).await
    }
}

/// Request `base + urlEncode(url)` through a public mirror proxy
pub struct MirrorStrategy {
    name: &'static str,
    transport: Arc<dyn HttpTransport>,
    endpoint: ProxyEndpoint,
    timeout: Duration,
}

impl MirrorStrategy {
    pub fn new(
        name: &'static str,
        transport: Arc<dyn HttpTransport>,
        endpoint: ProxyEndpoint,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            transport,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl FetchStrategy for MirrorStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn target_for(&self, url: &Url) -> String {
        self.endpoint.rewrite(url.as_str())
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes, ProxyError> {
        let request = HttpRequest::get(&self.target_for(url))?.omit_credentials();
        fetch_body(self.transport.as_ref(), request, self.timeout).await
    }
}

/// Ordered strategy list backed by the Cache Store
pub struct ProxyLadder {
    strategies: Vec<Box<dyn FetchStrategy>>,
    cache: CacheStore,
}

impl ProxyLadder {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            strategies: Vec::new(),
            cache,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn FetchStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Direct → primary mirror → secondary mirror, as configured
    pub fn from_config(
        config: &ProxyConfig,
        transport: Arc<dyn HttpTransport>,
        cache: CacheStore,
        timeout: Duration,
    ) -> Self {
        Self::new(cache)
            .with_strategy(Box::new(DirectStrategy::new(
                transport.clone(),
                config.direct_headers.clone(),
                DomainList::new(config.direct_blocked_domains.iter().cloned()),
                timeout,
            )))
            .with_strategy(Box::new(MirrorStrategy::new(
                "primary-mirror",
                transport.clone(),
                ProxyEndpoint::new(config.primary.clone()),
                timeout,
            )))
            .with_strategy(Box::new(MirrorStrategy::new(
                "secondary-mirror",
                transport,
                ProxyEndpoint::new(config.secondary.clone()),
                timeout,
            )))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Content of `url` from the cache, or from the first strategy that succeeds
    pub async fn resolve(&self, url: &str) -> Result<Bytes, ProxyError> {
        let parsed =
            Url::parse(url).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", url, e)))?;

        match self.cache.get(CacheTable::Responses, url).await {
            Ok(Some(cached)) => {
                debug!(url, "Proxy ladder cache hit");
                return Ok(Bytes::from(cached));
            }
            Ok(None) => {}
            Err(e) => warn!(url, error = %e, "Cache read failed, walking ladder"),
        }

        let mut attempts = Vec::with_capacity(self.strategies.len());
        let mut last_error: Option<ProxyError> = None;

        for (index, strategy) in self.strategies.iter().enumerate() {
            let target_url = strategy.target_for(&parsed);

            if !strategy.applies_to(&parsed) {
                debug!(url, strategy = strategy.name(), "Strategy skipped");
                attempts.push(ProxyAttempt {
                    strategy_index: index,
                    strategy: strategy.name(),
                    target_url,
                    outcome: AttemptOutcome::Skipped,
                });
                continue;
            }

            debug!(url, strategy = strategy.name(), target = %target_url, "Trying strategy");
            match strategy.fetch(&parsed).await {
                Ok(content) => {
                    info!(
                        url,
                        strategy = strategy.name(),
                        bytes = content.len(),
                        "Resolved through proxy ladder"
                    );
                    if let Err(e) = self
                        .cache
                        .put(CacheTable::Responses, url, content.to_vec())
                        .await
                    {
                        warn!(url, error = %e, "Cache write failed");
                    }
                    return Ok(content);
                }
                Err(e) => {
                    warn!(url, strategy = strategy.name(), error = %e, "Strategy failed");
                    attempts.push(ProxyAttempt {
                        strategy_index: index,
                        strategy: strategy.name(),
                        target_url,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            ProxyError::Transport(TransportError::Request(
                "no strategy applies to this URL".to_string(),
            ))
        });
        Err(ProxyError::NetworkUnavailable {
            url: url.to_string(),
            last: Box::new(last),
            attempts,
        })
    }
}
