// Transfer Engine - single-flight, cancellable, progress-instrumented download
//
// One transfer runs at a time per engine. The caller gets a `TransferHandle`
// that can cancel the transfer and await its outcome but never touches the
// session state. Events go to the caller's `ProgressSink`: zero or more
// `Progress` events with non-decreasing `bytes_loaded`, then exactly one
// terminal event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::errors::{TranscodeError, TransferError};
use super::http::{HttpRequest, HttpTransport};
use super::models::{Artifact, FormatDescriptor, TransferEvent, TransferProgress};
use super::traits::{ProgressSink, Transcoder};
use super::transcode::MP3_MIME;

type TransferOutcome = Result<Artifact, TransferError>;

/// Per-transfer caller choices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Hand the finished bytes to the transcoder (audio extraction to MP3)
    pub transcode: bool,
}

/// Caller's view of a transfer: cancel it, poll it, await it
#[derive(Clone)]
pub struct TransferHandle {
    id: u64,
    source_url: String,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Signal cancellation. No-op once the transfer has finished or was
    /// already cancelled.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() && !self.is_finished() {
            debug!(id = self.id, "Transfer cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Resolve to the artifact, or to `Cancelled`/the failure cause
    pub async fn wait(&self) -> TransferOutcome {
        let mut outcome = self.outcome.clone();
        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                return outcome.borrow().clone().unwrap_or_else(|| {
                    Err(TransferError::Network("transfer task ended without a result".to_string()))
                });
            }
        }
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("source_url", &self.source_url)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Publishes a transfer's outcome and frees the engine slot. Dropped without
/// `finish` (the task panicked or was aborted) it publishes a failure instead.
struct Completion {
    id: u64,
    slot: Arc<Mutex<Option<TransferHandle>>>,
    outcome_tx: Option<watch::Sender<Option<TransferOutcome>>>,
}

impl Completion {
    fn finish(&mut self, outcome: TransferOutcome) {
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(Some(outcome));
        }
        self.release();
    }

    fn release(&self) {
        let mut active = TransferEngine::slot(&self.slot);
        if active.as_ref().map_or(false, |h| h.id == self.id) {
            *active = None;
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.outcome_tx.take() {
            error!(id = self.id, "Transfer task ended without an outcome");
            let _ = tx.send(Some(Err(TransferError::Network(
                "transfer task aborted".to_string(),
            ))));
            self.release();
        }
    }
}

/// Byte accounting for one transfer; owned by the transfer task only
struct TransferSession {
    source_url: String,
    /// Declared `Content-Length`; drives `percent`
    declared_total: Option<u64>,
    /// Declared length, else the format's size estimate; drives the ETA
    expected_total: Option<u64>,
    bytes_received: u64,
    started_at: Instant,
    chunks: Vec<Bytes>,
}

impl TransferSession {
    fn new(source_url: &str, declared_total: Option<u64>, estimate: Option<u64>) -> Self {
        Self {
            source_url: source_url.to_string(),
            declared_total,
            expected_total: declared_total.or(estimate),
            bytes_received: 0,
            started_at: Instant::now(),
            chunks: Vec::new(),
        }
    }

    fn record(&mut self, chunk: Bytes) -> TransferProgress {
        self.bytes_received += chunk.len() as u64;
        self.chunks.push(chunk);
        self.progress(self.started_at.elapsed())
    }

    fn progress(&self, elapsed: Duration) -> TransferProgress {
        let received = self.bytes_received;
        let percent = match self.declared_total {
            Some(total) if total > 0 => (received as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        };
        let secs = elapsed.as_secs_f64();
        let bytes_per_second = if secs > 0.0 { received as f64 / secs } else { 0.0 };
        let eta_seconds = match self.expected_total {
            Some(total) if bytes_per_second > 0.0 => {
                Some(total.saturating_sub(received) as f64 / bytes_per_second)
            }
            _ => None,
        };
        TransferProgress {
            percent,
            bytes_loaded: received,
            bytes_per_second,
            eta_seconds,
        }
    }

    /// Concatenate the chunks, consuming the session
    fn into_bytes(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.bytes_received as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

pub struct TransferEngine {
    transport: Arc<dyn HttpTransport>,
    transcoder: Option<Arc<dyn Transcoder>>,
    active: Arc<Mutex<Option<TransferHandle>>>,
    next_id: AtomicU64,
}

impl TransferEngine {
    /// `transport` should already carry the Edge Proxy for restricted domains
    pub fn new(transport: Arc<dyn HttpTransport>, transcoder: Option<Arc<dyn Transcoder>>) -> Self {
        Self {
            transport,
            transcoder,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(active: &Mutex<Option<TransferHandle>>) -> MutexGuard<'_, Option<TransferHandle>> {
        active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle of the transfer in flight, if any
    pub fn active(&self) -> Option<TransferHandle> {
        Self::slot(&self.active)
            .as_ref()
            .filter(|h| !h.is_finished())
            .cloned()
    }

    /// Start downloading `format`. While a transfer is active this is a no-op
    /// that returns the existing handle.
    pub fn start(
        &self,
        format: &FormatDescriptor,
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> TransferHandle {
        let mut active = Self::slot(&self.active);
        if let Some(existing) = active.as_ref().filter(|h| !h.is_finished()) {
            debug!(id = existing.id, "Transfer already active, returning its handle");
            return existing.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = TransferHandle {
            id,
            source_url: format.url.clone(),
            cancel: cancel.clone(),
            outcome: outcome_rx,
        };
        *active = Some(handle.clone());
        drop(active);

        info!(id, format_id = %format.format_id, url = %format.url, "Transfer started");

        let transport = self.transport.clone();
        let transcoder = self.transcoder.clone();
        let completion = Completion {
            id,
            slot: self.active.clone(),
            outcome_tx: Some(outcome_tx),
        };
        let format = format.clone();
        tokio::spawn(async move {
            let mut completion = completion;
            let outcome = run_transfer(transport, transcoder, &format, options, &cancel, sink.as_ref()).await;

            match &outcome {
                Ok(artifact) => {
                    info!(id, bytes = artifact.len(), mime = %artifact.mime_type, "Transfer completed");
                    sink.emit(TransferEvent::Completed {
                        total_bytes: artifact.len() as u64,
                        mime_type: artifact.mime_type.clone(),
                    });
                }
                Err(TransferError::Cancelled) => {
                    info!(id, "Transfer cancelled");
                    sink.emit(TransferEvent::Cancelled);
                }
                Err(e) => {
                    error!(id, error = %e, "Transfer failed");
                    sink.emit(TransferEvent::Failed(e.clone()));
                }
            }

            completion.finish(outcome);
        });

        handle
    }

    /// `start` and await the outcome
    pub async fn download(
        &self,
        format: &FormatDescriptor,
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> TransferOutcome {
        self.start(format, options, sink).wait().await
    }
}

async fn run_transfer(
    transport: Arc<dyn HttpTransport>,
    transcoder: Option<Arc<dyn Transcoder>>,
    format: &FormatDescriptor,
    options: TransferOptions,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> TransferOutcome {
    let request = HttpRequest::get(&format.url)
        .map_err(|e| TransferError::Network(e.to_string()))?
        .omit_credentials();

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        response = transport.send(request) => {
            response.map_err(|e| TransferError::Network(e.to_string()))?
        }
    };

    if !response.status.is_success() {
        return Err(TransferError::status(response.status));
    }

    let mime_type = response
        .content_type()
        .unwrap_or_else(|| format.guess_mime().to_string());
    let mut session = TransferSession::new(&format.url, response.content_length(), format.filesize_bytes);
    debug!(
        url = %session.source_url,
        declared = ?session.declared_total,
        expected = ?session.expected_total,
        "Response accepted, streaming body"
    );

    let mut body = response.body;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            next = body.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(TransferError::Network(e.to_string())),
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => sink.emit(TransferEvent::Progress(session.record(chunk))),
        }
    }

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let artifact = Artifact::new(session.into_bytes(), mime_type);
    if !options.transcode {
        return Ok(artifact);
    }

    let Some(transcoder) = transcoder else {
        return Err(TransferError::Transcode {
            source: TranscodeError::NotAvailable("no transcoder configured".to_string()),
            original: artifact,
        });
    };

    debug!(transcoder = transcoder.name(), "Handing artifact to transcoder");
    match transcoder
        .transcode(artifact.bytes.clone(), &artifact.mime_type)
        .await
    {
        Ok(bytes) => Ok(Artifact::new(bytes, MP3_MIME)),
        Err(source) => Err(TransferError::Transcode {
            source,
            original: artifact,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::TransportError;
    use crate::downloader::http::HttpResponse;
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
    use reqwest::StatusCode;

    /// Serves one fixed response; counts requests
    struct ChunkedTransport {
        status: StatusCode,
        chunks: Vec<usize>,
        declare_length: bool,
        content_type: Option<&'static str>,
        /// Body errors after this many chunks
        fail_after: Option<usize>,
        requests: AtomicU64,
    }

    impl ChunkedTransport {
        fn new(chunks: Vec<usize>, declare_length: bool) -> Self {
            Self {
                status: StatusCode::OK,
                chunks,
                declare_length,
                content_type: Some("video/mp4"),
                fail_after: None,
                requests: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ChunkedTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            if self.declare_length {
                let total: usize = self.chunks.iter().sum();
                headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
            }
            if let Some(ct) = self.content_type {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
            }
            let chunks: Vec<Bytes> = self
                .chunks
                .iter()
                .map(|n| Bytes::from(vec![7u8; *n]))
                .collect();
            match self.fail_after {
                None => Ok(HttpResponse::from_chunks(self.status, headers, chunks)),
                Some(n) => {
                    let items = chunks
                        .into_iter()
                        .take(n)
                        .map(Ok)
                        .chain(std::iter::once(Err(TransportError::Body(
                            "connection reset".to_string(),
                        ))));
                    Ok(HttpResponse {
                        status: self.status,
                        headers,
                        body: futures::stream::iter(items).boxed(),
                    })
                }
            }
        }
    }

    struct FailingTranscoder;

    #[async_trait]
    impl Transcoder for FailingTranscoder {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn transcode(&self, _bytes: Bytes, _mime: &str) -> Result<Bytes, TranscodeError> {
            Err(TranscodeError::Failed("codec not supported".to_string()))
        }
    }

    struct FixedTranscoder;

    #[async_trait]
    impl Transcoder for FixedTranscoder {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn transcode(&self, _bytes: Bytes, _mime: &str) -> Result<Bytes, TranscodeError> {
            Ok(Bytes::from_static(b"ID3"))
        }
    }

    fn format(url: &str) -> FormatDescriptor {
        FormatDescriptor {
            format_id: "18".to_string(),
            extension: "mp4".to_string(),
            url: url.to_string(),
            video_codec: Some("avc1".to_string()),
            audio_codec: None,
            width: None,
            height: None,
            resolution_label: None,
            fps: None,
            filesize_bytes: None,
            format_note: None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<TransferEvent>>>, Arc<dyn ProgressSink>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: TransferEvent| {
            sink_events.lock().unwrap().push(event);
        });
        (events, sink)
    }

    fn percents(events: &[TransferEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_declared_length_progress_in_quarters() {
        let transport = Arc::new(ChunkedTransport::new(vec![250_000; 4], true));
        let engine = TransferEngine::new(transport, None);
        let (events, sink) = recorder();

        let artifact = engine
            .download(&format("https://cdn.example/18.mp4"), TransferOptions::default(), sink)
            .await
            .unwrap();
        assert_eq!(artifact.len(), 1_000_000);
        assert_eq!(artifact.mime_type, "video/mp4");

        let events = events.lock().unwrap();
        assert_eq!(percents(&events), vec![25.0, 50.0, 75.0, 100.0]);

        let loaded: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) => Some(p.bytes_loaded),
                _ => None,
            })
            .collect();
        assert!(loaded.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(events.len(), 5);
        match events.last().unwrap() {
            TransferEvent::Completed { total_bytes, .. } => assert_eq!(*total_bytes, 1_000_000),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_after_second_chunk() {
        let transport = Arc::new(ChunkedTransport::new(vec![250_000; 4], true));
        let engine = TransferEngine::new(transport, None);

        let events = Arc::new(Mutex::new(Vec::new()));
        let handle_slot: Arc<Mutex<Option<TransferHandle>>> = Arc::new(Mutex::new(None));
        let sink_events = events.clone();
        let sink_slot = handle_slot.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: TransferEvent| {
            let cancel_now = matches!(&event, TransferEvent::Progress(p) if p.bytes_loaded == 500_000);
            sink_events.lock().unwrap().push(event);
            if cancel_now {
                if let Some(handle) = sink_slot.lock().unwrap().as_ref() {
                    handle.cancel();
                }
            }
        });

        // current_thread runtime: the task cannot run before the slot is filled
        let handle = engine.start(&format("https://cdn.example/18.mp4"), TransferOptions::default(), sink);
        *handle_slot.lock().unwrap() = Some(handle.clone());

        let err = handle.wait().await.unwrap_err();
        assert!(err.is_cancelled());

        let events = events.lock().unwrap();
        assert_eq!(percents(&events), vec![25.0, 50.0]);
        assert!(matches!(events.last(), Some(TransferEvent::Cancelled)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        // Cancelling a finished transfer is a no-op
        handle.cancel();
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_length_stays_indeterminate() {
        let mut transport = ChunkedTransport::new(vec![200, 300], false);
        transport.content_type = None;
        let engine = TransferEngine::new(Arc::new(transport), None);
        let (events, sink) = recorder();

        let artifact = engine
            .download(&format("https://cdn.example/18.mp4"), TransferOptions::default(), sink)
            .await
            .unwrap();
        assert_eq!(artifact.len(), 500);
        // No content type: guessed from the extension
        assert_eq!(artifact.mime_type, "video/mp4");

        let events = events.lock().unwrap();
        assert!(percents(&events).iter().all(|p| *p == 0.0));
        assert!(events.iter().all(|e| match e {
            TransferEvent::Progress(p) => p.eta_seconds.is_none(),
            _ => true,
        }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let mut transport = ChunkedTransport::new(vec![10], true);
        transport.status = StatusCode::FORBIDDEN;
        let engine = TransferEngine::new(Arc::new(transport), None);
        let (events, sink) = recorder();

        let err = engine
            .download(&format("https://cdn.example/18.mp4"), TransferOptions::default(), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::HttpStatus(403)));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransferEvent::Failed(TransferError::HttpStatus(403))));
    }

    #[tokio::test]
    async fn test_start_is_single_flight() {
        let transport = Arc::new(ChunkedTransport::new(vec![100; 3], true));
        let engine = TransferEngine::new(transport.clone(), None);
        let (_events, sink) = recorder();

        let first = engine.start(&format("https://cdn.example/a.mp4"), TransferOptions::default(), sink.clone());
        let second = engine.start(&format("https://cdn.example/b.mp4"), TransferOptions::default(), sink.clone());
        assert_eq!(first.id(), second.id());
        assert_eq!(second.source_url(), "https://cdn.example/a.mp4");

        first.wait().await.unwrap();
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);

        // A finished transfer frees the slot
        let third = engine.start(&format("https://cdn.example/c.mp4"), TransferOptions::default(), sink);
        assert_ne!(third.id(), first.id());
        third.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_error_mid_stream_fails_once() {
        let mut transport = ChunkedTransport::new(vec![250; 4], true);
        transport.fail_after = Some(1);
        let engine = TransferEngine::new(Arc::new(transport), None);
        let (events, sink) = recorder();

        let err = engine
            .download(&format("https://cdn.example/18.mp4"), TransferOptions::default(), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));

        let events = events.lock().unwrap();
        assert_eq!(percents(&events), vec![25.0]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(TransferEvent::Failed(TransferError::Network(_)))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_wedge_engine() {
        let transport = Arc::new(ChunkedTransport::new(vec![100; 2], true));
        let engine = TransferEngine::new(transport, None);
        let sink: Arc<dyn ProgressSink> = Arc::new(|event: TransferEvent| {
            if matches!(event, TransferEvent::Progress(_)) {
                panic!("sink failure");
            }
        });

        let first = engine.start(&format("https://cdn.example/a.mp4"), TransferOptions::default(), sink);
        let err = first.wait().await.unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert!(first.is_finished());
        assert!(engine.active().is_none());

        let (_events, sink) = recorder();
        let second = engine.start(&format("https://cdn.example/b.mp4"), TransferOptions::default(), sink);
        assert_ne!(second.id(), first.id());
        assert_eq!(second.source_url(), "https://cdn.example/b.mp4");
        assert_eq!(second.wait().await.unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_transcode_failure_keeps_original() {
        let transport = Arc::new(ChunkedTransport::new(vec![64], true));
        let engine = TransferEngine::new(transport, Some(Arc::new(FailingTranscoder)));
        let (events, sink) = recorder();

        let err = engine
            .download(
                &format("https://cdn.example/18.mp4"),
                TransferOptions { transcode: true },
                sink,
            )
            .await
            .unwrap_err();
        let original = err.recovered_artifact().unwrap();
        assert_eq!(original.len(), 64);
        assert_eq!(original.mime_type, "video/mp4");
        assert!(matches!(events.lock().unwrap().last(), Some(TransferEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_transcoded_artifact_is_mp3() {
        let transport = Arc::new(ChunkedTransport::new(vec![64], true));
        let engine = TransferEngine::new(transport, Some(Arc::new(FixedTranscoder)));
        let (_events, sink) = recorder();

        let artifact = engine
            .download(
                &format("https://cdn.example/18.mp4"),
                TransferOptions { transcode: true },
                sink,
            )
            .await
            .unwrap();
        assert_eq!(artifact.mime_type, "audio/mpeg");
        assert_eq!(&artifact.bytes[..], b"ID3");
    }

    #[test]
    fn test_throughput_and_eta() {
        let mut session = TransferSession::new("https://cdn.example/x", None, Some(1000));
        session.bytes_received = 250;
        let progress = session.progress(Duration::from_secs(1));
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.bytes_per_second, 250.0);
        assert_eq!(progress.eta_seconds, Some(3.0));

        let stalled = session.progress(Duration::ZERO);
        assert_eq!(stalled.bytes_per_second, 0.0);
        assert_eq!(stalled.eta_seconds, None);
    }
}
