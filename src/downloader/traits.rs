// Collaborator seams of the Transfer Engine

use async_trait::async_trait;
use bytes::Bytes;

use super::errors::TranscodeError;
use super::models::TransferEvent;

/// Receives a transfer's events in order
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(TransferEvent) + Send + Sync,
{
    fn emit(&self, event: TransferEvent) {
        self(event)
    }
}

/// Sink that drops every event
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Post-processing service: `transcode(bytes, sourceMime) -> bytes` tagged `audio/mpeg`
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Name of the transcoder (for logging)
    fn name(&self) -> &'static str;

    async fn transcode(&self, bytes: Bytes, source_mime: &str) -> Result<Bytes, TranscodeError>;
}
