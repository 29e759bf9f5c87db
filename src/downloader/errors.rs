// Error types for the acquisition pipeline
//
// Each component owns one enum. Recoverable failures (a single proxy strategy,
// a cache read) are handled where they occur; the types below are what reaches
// the caller.

use reqwest::StatusCode;
use thiserror::Error;

use super::extractors::{diagnose_error, BlockingReason};
use super::models::Artifact;
use super::proxy::ProxyAttempt;

/// Persistent cache failures. Never fatal to an extraction or a transfer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage could not be opened; the store degrades to a bypass
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Cache worker failed: {0}")]
    Worker(String),
}

/// Failures of the client HTTP transport itself (connect, TLS, body read)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Body read failed: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Proxy Ladder failures
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A single strategy got a non-success status
    #[error("HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Every strategy was tried (or skipped) without success
    #[error("Network unavailable for {url}: {last}")]
    NetworkUnavailable {
        url: String,
        last: Box<ProxyError>,
        attempts: Vec<ProxyAttempt>,
    },
}

/// Errors raised by an extraction engine or by its network primitive
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Extraction engine not available: {0}")]
    NotAvailable(String),

    #[error("Failed to launch extraction engine: {0}")]
    Launch(String),

    /// The engine ran and reported an error (site parsing, blocked, ...)
    #[error("{0}")]
    Reported(String),

    #[error("Network access failed: {0}")]
    Network(String),

    #[error("Invalid engine output: {0}")]
    Output(String),
}

/// Why an extraction failed
#[derive(Debug, Clone, Error)]
pub enum ExtractionCause {
    #[error("engine initialization failed: {0}")]
    Initialization(EngineError),

    #[error("{0}")]
    Engine(EngineError),

    #[error("could not decode engine result: {0}")]
    Decode(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("extraction task aborted: {0}")]
    Aborted(String),

    #[error("invalid URL")]
    InvalidUrl,
}

/// The single error the Extraction Orchestrator reports
#[derive(Debug, Clone, Error)]
#[error("Extraction failed for {url}: {cause}")]
pub struct ExtractionFailed {
    pub url: String,
    pub cause: ExtractionCause,
}

impl ExtractionFailed {
    pub fn new(url: impl Into<String>, cause: ExtractionCause) -> Self {
        Self {
            url: url.into(),
            cause,
        }
    }

    /// Blocking reason inferred from the engine's error text
    pub fn blocking_reason(&self) -> Option<BlockingReason> {
        match &self.cause {
            ExtractionCause::Timeout(_) => Some(BlockingReason::NetworkTimeout),
            ExtractionCause::InvalidUrl => None,
            cause => diagnose_error(&cause.to_string()),
        }
    }

    /// One human-readable line (plus suggestion) for the user
    pub fn status_message(&self) -> String {
        match self.blocking_reason() {
            Some(reason) if reason != BlockingReason::Unknown => format!(
                "Could not read media info: {}.\n{}",
                reason.description(),
                reason.suggestion()
            ),
            _ => format!("Could not read media info: {}", self.cause),
        }
    }
}

/// Post-processing failures
#[derive(Debug, Clone, Error)]
pub enum TranscodeError {
    #[error("Transcoder not available: {0}")]
    NotAvailable(String),

    #[error("Transcoding failed: {0}")]
    Failed(String),
}

/// Transfer Engine failures. `Cancelled` is carried here so `wait()` has one
/// error type, but it is never reported as a failure.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("Server responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Download cancelled")]
    Cancelled,

    /// The download finished but post-processing did not; `original` is the
    /// untranscoded artifact
    #[error("{source}")]
    Transcode {
        source: TranscodeError,
        original: Artifact,
    },
}

impl TransferError {
    pub fn status(code: StatusCode) -> Self {
        Self::HttpStatus(code.as_u16())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Bytes that are still usable despite the error
    pub fn recovered_artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Transcode { original, .. } => Some(original),
            _ => None,
        }
    }

    pub fn status_message(&self) -> String {
        match self {
            Self::HttpStatus(403) => {
                "Download refused (HTTP 403). The link may have expired; fetch the info again."
                    .to_string()
            }
            Self::HttpStatus(code) => format!("Download failed: HTTP {}", code),
            Self::Network(cause) => format!("Download failed: {}", cause),
            Self::Cancelled => "Download cancelled".to_string(),
            Self::Transcode { source, .. } => {
                format!("{}. The original file is kept.", source)
            }
        }
    }
}

/// Session construction failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
