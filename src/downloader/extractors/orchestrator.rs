// Extraction Orchestrator - cached, lazily initialized engine calls
//
// Flow:
// 1. Cache lookup by canonical URL (live hit returns immediately)
// 2. Engine initialization, once per session
// 3. Engine call on the blocking pool with a ladder-backed network primitive
// 4. Decode, stamp `fetched_at`, write to the cache

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::bridge::SessionFetcher;
use super::traits::{decode_engine_result, EngineOptions, ExtractionEngine};
use crate::downloader::cache::{CacheStore, CacheTable};
use crate::downloader::errors::{ExtractionCause, ExtractionFailed};
use crate::downloader::models::ExtractionResult;
use crate::downloader::proxy::ProxyLadder;

/// Cache key and result URL: parsed, normalized, fragment dropped
pub fn canonical_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url.trim()).ok()?;
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

pub struct ExtractionOrchestrator {
    engine: Arc<dyn ExtractionEngine>,
    ladder: Arc<ProxyLadder>,
    cache: CacheStore,
    options: EngineOptions,
    timeout: Duration,
    initialized: OnceCell<()>,
}

impl ExtractionOrchestrator {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        ladder: Arc<ProxyLadder>,
        cache: CacheStore,
        options: EngineOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            ladder,
            cache,
            options,
            timeout,
            initialized: OnceCell::new(),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Metadata and formats for `url`, from the cache when live
    pub async fn extract(&self, url: &str) -> Result<ExtractionResult, ExtractionFailed> {
        let Some(canonical) = canonical_url(url) else {
            return Err(ExtractionFailed::new(url.trim(), ExtractionCause::InvalidUrl));
        };
        let url = canonical.as_str();

        if let Some(cached) = self.cached(url).await {
            return Ok(cached);
        }

        self.ensure_initialized()
            .await
            .map_err(|cause| ExtractionFailed::new(url, cause))?;

        let json = self
            .run_engine(url)
            .await
            .map_err(|cause| ExtractionFailed::new(url, cause))?;

        let mut result = decode_engine_result(url, &json)
            .map_err(|e| ExtractionFailed::new(url, ExtractionCause::Decode(e)))?;
        result.fetched_at = self.cache.now_millis();

        info!(
            url,
            title = %result.title,
            formats = result.formats.len(),
            "Extraction complete"
        );
        self.store(&result).await;
        Ok(result)
    }

    async fn cached(&self, url: &str) -> Option<ExtractionResult> {
        match self.cache.get(CacheTable::Extractors, url).await {
            Ok(Some(data)) => match serde_json::from_slice::<ExtractionResult>(&data) {
                Ok(result) => {
                    debug!(url, "Extraction cache hit");
                    Some(result)
                }
                Err(e) => {
                    warn!(url, error = %e, "Ignoring undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(url, error = %e, "Cache read failed, extracting");
                None
            }
        }
    }

    async fn store(&self, result: &ExtractionResult) {
        let data = match serde_json::to_vec(result) {
            Ok(data) => data,
            Err(e) => {
                warn!(url = %result.url, error = %e, "Could not serialize extraction result");
                return;
            }
        };
        if let Err(e) = self.cache.put(CacheTable::Extractors, &result.url, data).await {
            warn!(url = %result.url, error = %e, "Cache write failed");
        }
    }

    async fn ensure_initialized(&self) -> Result<(), ExtractionCause> {
        self.initialized
            .get_or_try_init(|| async {
                let engine = self.engine.clone();
                info!(engine = engine.name(), "Initializing extraction engine");
                tokio::task::spawn_blocking(move || engine.initialize())
                    .await
                    .map_err(|e| ExtractionCause::Aborted(e.to_string()))?
                    .map_err(ExtractionCause::Initialization)
            })
            .await
            .map(|_| ())
    }

    async fn run_engine(&self, url: &str) -> Result<serde_json::Value, ExtractionCause> {
        let engine = self.engine.clone();
        let fetcher = SessionFetcher::new(self.ladder.clone(), Handle::current());
        let options = self.options.clone();
        let owned = url.to_string();

        debug!(url, engine = engine.name(), "Invoking extraction engine");
        let task = tokio::task::spawn_blocking(move || {
            engine.extract_info(&owned, &options, &fetcher)
        });

        // A timed-out engine call keeps its blocking thread until it returns;
        // its result is dropped
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(ExtractionCause::Timeout(self.timeout.as_secs())),
            Ok(Err(join)) => Err(ExtractionCause::Aborted(join.to_string())),
            Ok(Ok(result)) => result.map_err(ExtractionCause::Engine),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::cache::ManualClock;
    use crate::downloader::errors::EngineError;
    use crate::downloader::extractors::NetworkAccess;
    use crate::downloader::http::SpoofHeaders;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockEngine {
        init_calls: AtomicUsize,
        extract_calls: AtomicUsize,
        fail_first_init: bool,
        fail_extract: bool,
    }

    impl ExtractionEngine for MockEngine {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn initialize(&self) -> Result<(), EngineError> {
            let n = self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_init && n == 0 {
                return Err(EngineError::NotAvailable("not yet".to_string()));
            }
            Ok(())
        }

        fn extract_info(
            &self,
            _url: &str,
            _options: &EngineOptions,
            _network: &dyn NetworkAccess,
        ) -> Result<serde_json::Value, EngineError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_extract {
                return Err(EngineError::Reported(
                    "ERROR: HTTP Error 403: Forbidden".to_string(),
                ));
            }
            Ok(json!({
                "title": "Demo",
                "duration": 125,
                "formats": [{
                    "format_id": "18",
                    "ext": "mp4",
                    "vcodec": "avc1",
                    "url": "https://cdn.example/18.mp4"
                }]
            }))
        }
    }

    fn orchestrator(engine: Arc<MockEngine>, cache: CacheStore) -> ExtractionOrchestrator {
        let options = EngineOptions::new(&SpoofHeaders {
            user_agent: "UA".to_string(),
            referer: "https://www.google.com".to_string(),
            origin: None,
            accept: None,
        });
        ExtractionOrchestrator::new(
            engine,
            Arc::new(ProxyLadder::new(CacheStore::bypass())),
            cache,
            options,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_second_extract_is_a_cache_hit() {
        let engine = Arc::new(MockEngine::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = CacheStore::in_memory().unwrap().with_clock(clock.clone());
        let orchestrator = orchestrator(engine.clone(), cache);

        let url = "https://video.example/watch?id=42";
        let first = orchestrator.extract(url).await.unwrap();
        let second = orchestrator.extract(url).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.fetched_at, 1_000_000);
        assert_eq!(engine.extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_reinvokes_engine() {
        let engine = Arc::new(MockEngine::default());
        let clock = Arc::new(ManualClock::new(0));
        let cache = CacheStore::in_memory().unwrap().with_clock(clock.clone());
        let orchestrator = orchestrator(engine.clone(), cache);

        let url = "https://video.example/watch?id=42";
        orchestrator.extract(url).await.unwrap();
        clock.advance(Duration::from_secs(3601));
        orchestrator.extract(url).await.unwrap();

        assert_eq!(engine.extract_calls.load(Ordering::SeqCst), 2);
        // Initialized once per session regardless
        assert_eq!(engine.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_initialization_is_retried() {
        let engine = Arc::new(MockEngine {
            fail_first_init: true,
            ..Default::default()
        });
        let orchestrator = orchestrator(engine.clone(), CacheStore::bypass());
        let url = "https://video.example/watch?id=42";

        let err = orchestrator.extract(url).await.unwrap_err();
        assert!(matches!(err.cause, ExtractionCause::Initialization(_)));
        assert_eq!(engine.extract_calls.load(Ordering::SeqCst), 0);

        orchestrator.extract(url).await.unwrap();
        assert_eq!(engine.init_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_is_not_cached() {
        let engine = Arc::new(MockEngine {
            fail_extract: true,
            ..Default::default()
        });
        let cache = CacheStore::in_memory().unwrap();
        let orchestrator = orchestrator(engine.clone(), cache.clone());
        let url = "https://video.example/watch?id=42";

        let err = orchestrator.extract(url).await.unwrap_err();
        assert!(matches!(err.cause, ExtractionCause::Engine(_)));
        assert!(err.status_message().contains("403"));
        assert!(cache.get(CacheTable::Extractors, url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_equivalent_urls_share_one_cache_entry() {
        let engine = Arc::new(MockEngine::default());
        let cache = CacheStore::in_memory().unwrap();
        let orchestrator = orchestrator(engine.clone(), cache.clone());

        let first = orchestrator
            .extract("  HTTPS://Video.Example/watch?id=42#t=30 ")
            .await
            .unwrap();
        let second = orchestrator
            .extract("https://video.example/watch?id=42")
            .await
            .unwrap();

        assert_eq!(first.url, "https://video.example/watch?id=42");
        assert_eq!(first, second);
        assert_eq!(engine.extract_calls.load(Ordering::SeqCst), 1);
        assert!(cache
            .get(CacheTable::Extractors, "https://video.example/watch?id=42")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_canonical_url() {
        assert_eq!(
            canonical_url("https://a.example/v#frag").as_deref(),
            Some("https://a.example/v")
        );
        assert_eq!(canonical_url("https://a.example").as_deref(), Some("https://a.example/"));
        assert_eq!(canonical_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_invalid_url_never_reaches_engine() {
        let engine = Arc::new(MockEngine::default());
        let orchestrator = orchestrator(engine.clone(), CacheStore::bypass());
        let err = orchestrator.extract("not a url").await.unwrap_err();
        assert!(matches!(err.cause, ExtractionCause::InvalidUrl));
        assert_eq!(engine.init_calls.load(Ordering::SeqCst), 0);
    }
}
