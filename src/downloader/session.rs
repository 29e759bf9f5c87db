// Media Session - the pipeline's context object
//
// Constructed once at pipeline start, owns every component, dropped at the end.
// Wiring:
// - Proxy Ladder over the raw transport (it does its own proxying)
// - Transfer Engine over the Edge Proxy, so restricted hosts are rewritten
// - One Cache Store shared by the orchestrator and the ladder

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::cache::CacheStore;
use super::errors::{ExtractionFailed, SessionError, TransferError};
use super::extractors::{
    canonical_url, EngineOptions, ExtractionEngine, ExtractionOrchestrator, FallbackExtractor,
    YtDlpEngine,
};
use super::http::{HttpTransport, ReqwestTransport};
use super::models::{Artifact, ExtractionResult, FormatDescriptor};
use super::proxy::{DomainList, EdgeProxy, ProxyLadder};
use super::traits::{ProgressSink, Transcoder};
use super::transcode::FfmpegTranscoder;
use super::transfer::{TransferEngine, TransferHandle, TransferOptions};
use crate::config::PipelineConfig;

pub struct MediaSession {
    config: PipelineConfig,
    cache: CacheStore,
    restricted: DomainList,
    orchestrator: ExtractionOrchestrator,
    transfers: TransferEngine,
    fallback: Option<Arc<dyn FallbackExtractor>>,
}

impl MediaSession {
    pub fn builder(config: PipelineConfig) -> MediaSessionBuilder {
        MediaSessionBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Extract metadata and formats. For restricted domains the fallback
    /// extractor, when configured, gets one try after the orchestrator fails.
    pub async fn extract(&self, url: &str) -> Result<ExtractionResult, ExtractionFailed> {
        let err = match self.orchestrator.extract(url).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        let Some(fallback) = &self.fallback else {
            return Err(err);
        };
        let Some(canonical) = canonical_url(url) else {
            return Err(err);
        };
        let restricted = reqwest::Url::parse(&canonical)
            .map_or(false, |u| self.restricted.matches_url(&u));
        if !restricted {
            return Err(err);
        }

        warn!(url, error = %err, fallback = fallback.name(), "Extraction failed, trying fallback extractor");
        match fallback.extract(&canonical).await {
            Ok(mut result) => {
                result.fetched_at = self.cache.now_millis();
                info!(url, fallback = fallback.name(), "Fallback extractor succeeded");
                Ok(result)
            }
            Err(fallback_err) => {
                warn!(url, error = %fallback_err, "Fallback extractor failed");
                Err(err)
            }
        }
    }

    /// Start downloading `format` (single-flight)
    pub fn start_transfer(
        &self,
        format: &FormatDescriptor,
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> TransferHandle {
        self.transfers.start(format, options, sink)
    }

    pub async fn download(
        &self,
        format: &FormatDescriptor,
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Artifact, TransferError> {
        self.transfers.download(format, options, sink).await
    }

    /// Cancel any transfer in flight and drop the session
    pub fn shutdown(self) {
        if let Some(handle) = self.transfers.active() {
            handle.cancel();
        }
        info!("Media session closed");
    }
}

pub struct MediaSessionBuilder {
    config: PipelineConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    engine: Option<Arc<dyn ExtractionEngine>>,
    cache: Option<CacheStore>,
    transcoder: Option<Arc<dyn Transcoder>>,
    fallback: Option<Arc<dyn FallbackExtractor>>,
}

impl MediaSessionBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            transport: None,
            engine: None,
            cache: None,
            transcoder: None,
            fallback: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ExtractionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackExtractor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn default_cache(config: &PipelineConfig) -> CacheStore {
        if !config.cache.enabled {
            return CacheStore::bypass();
        }
        let path = config
            .cache
            .path
            .clone()
            .unwrap_or_else(CacheStore::default_path);
        CacheStore::open_or_bypass(path).with_ttl(Duration::from_secs(config.cache.ttl_seconds))
    }

    pub fn build(self) -> Result<MediaSession, SessionError> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(&config.network)
                    .map_err(|e| SessionError::HttpClient(e.to_string()))?,
            ),
        };
        let cache = self.cache.unwrap_or_else(|| Self::default_cache(&config));

        let ladder = Arc::new(ProxyLadder::from_config(
            &config.proxy,
            transport.clone(),
            cache.clone(),
            Duration::from_secs(config.network.timeout_seconds),
        ));

        let engine: Arc<dyn ExtractionEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(YtDlpEngine::new(&config.extraction)),
        };
        let options = EngineOptions::new(&config.proxy.direct_headers).with_proxy(
            config
                .extraction
                .upstream_proxy
                .clone()
                .or_else(|| config.network.proxy.clone()),
        );
        let orchestrator = ExtractionOrchestrator::new(
            engine,
            ladder.clone(),
            cache.clone(),
            options,
            Duration::from_secs(config.extraction.timeout_seconds),
        );

        let edge: Arc<dyn HttpTransport> = Arc::new(EdgeProxy::from_config(&config.proxy, transport));
        let transcoder: Arc<dyn Transcoder> = match self.transcoder {
            Some(transcoder) => transcoder,
            None => Arc::new(FfmpegTranscoder::new(&config.transfer)),
        };
        let transfers = TransferEngine::new(edge, Some(transcoder));

        info!(
            engine = orchestrator.engine_name(),
            cache = cache.is_enabled(),
            strategies = ?ladder.strategy_names(),
            "Media session ready"
        );

        Ok(MediaSession {
            restricted: DomainList::new(config.proxy.restricted_domains.iter().cloned()),
            config,
            cache,
            orchestrator,
            transfers,
            fallback: self.fallback,
        })
    }
}
