// Downloader module - media acquisition pipeline
//
// cache → proxy (ladder, edge) → extractors → transfer, wired by `session`

pub mod cache;
pub mod errors;
pub mod extractors;
pub mod format_selector;
pub mod http;
pub mod models;
pub mod proxy;
pub mod session;
pub mod traits;
pub mod transcode;
pub mod transfer;
pub mod utils;

pub use cache::{CacheStore, CacheTable};
pub use errors::{
    CacheError, EngineError, ExtractionCause, ExtractionFailed, ProxyError, SessionError,
    TranscodeError, TransferError, TransportError,
};
pub use format_selector::{FormatFilter, FormatSelector};
pub use models::{Artifact, ExtractionResult, FormatDescriptor, MediaKind, TransferEvent, TransferProgress};
pub use session::{MediaSession, MediaSessionBuilder};
pub use traits::{ProgressSink, Transcoder};
pub use transfer::{TransferEngine, TransferHandle, TransferOptions};
