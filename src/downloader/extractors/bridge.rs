// Blocking adapter between the synchronous engine and the async Proxy Ladder
//
// `fetch` is called on a blocking-pool thread. It submits the resolution to the
// runtime and parks the thread until it completes; this is a suspension point
// of the extraction, not a busy-wait. Must never be called from async context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::debug;

use super::traits::NetworkAccess;
use crate::downloader::errors::EngineError;
use crate::downloader::proxy::ProxyLadder;

/// Per-extraction network access through the Proxy Ladder
pub struct SessionFetcher {
    ladder: Arc<ProxyLadder>,
    runtime: Handle,
    /// Exact request URL -> content, for this extraction only
    seen: Mutex<HashMap<String, Bytes>>,
}

impl SessionFetcher {
    pub fn new(ladder: Arc<ProxyLadder>, runtime: Handle) -> Self {
        Self {
            ladder,
            runtime,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, url: &str) -> Option<Bytes> {
        self.seen
            .lock()
            .ok()
            .and_then(|seen| seen.get(url).cloned())
    }
}

impl NetworkAccess for SessionFetcher {
    fn fetch(&self, url: &str) -> Result<Bytes, EngineError> {
        if let Some(content) = self.cached(url) {
            debug!(url, "Sub-resource served from extraction cache");
            return Ok(content);
        }

        let ladder = self.ladder.clone();
        let owned = url.to_string();
        let task = self
            .runtime
            .spawn(async move { ladder.resolve(&owned).await });

        let content = self
            .runtime
            .block_on(task)
            .map_err(|e| EngineError::Network(format!("resolution task failed: {}", e)))?
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(url.to_string(), content.clone());
        }
        Ok(content)
    }
}
