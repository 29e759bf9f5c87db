// Extraction module - metadata and format resolution
//
// - traits: engine seam (`ExtractionEngine`, `NetworkAccess`) and JSON decoding
// - bridge: blocking adapter from the engine's synchronous fetch to the Proxy Ladder
// - relay: line protocol serving an engine child's fetches through `NetworkAccess`
// - ytdlp: yt-dlp child-process engine (Python module or zipapp)
// - orchestrator: cache-first, lazily initialized extraction
// - diagnostics: blocking-reason classification of engine errors

mod bridge;
mod diagnostics;
mod orchestrator;
mod relay;
mod traits;
mod ytdlp;

pub use bridge::SessionFetcher;
pub use diagnostics::{diagnose_error, BlockingReason};
pub use orchestrator::{canonical_url, ExtractionOrchestrator};
pub use relay::EngineCommand;
pub use traits::{
    decode_engine_result, EngineOptions, ExtractionEngine, FallbackExtractor, NetworkAccess,
};
pub use ytdlp::YtDlpEngine;
