// Extraction engine seam and engine-output decoding

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::downloader::errors::EngineError;
use crate::downloader::http::SpoofHeaders;
use crate::downloader::models::{ExtractionResult, FormatDescriptor};

/// Synchronous network primitive handed to an engine for every request it makes
pub trait NetworkAccess: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Bytes, EngineError>;
}

/// Fixed option set for info extraction
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub quiet: bool,
    pub no_warnings: bool,
    /// Resolve every entry instead of listing them
    pub extract_flat: bool,
    pub force_generic_extractor: bool,
    /// Always false: extraction never downloads media
    pub download: bool,
    pub http_headers: Vec<(String, String)>,
    /// Upstream proxy for engine requests the ladder cannot serve
    pub proxy: Option<String>,
}

impl EngineOptions {
    pub fn new(headers: &SpoofHeaders) -> Self {
        Self {
            quiet: true,
            no_warnings: true,
            extract_flat: false,
            force_generic_extractor: false,
            download: false,
            http_headers: headers.pairs(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// External component that turns a page URL into metadata and formats.
///
/// Calls are blocking; the orchestrator runs them on the blocking pool.
pub trait ExtractionEngine: Send + Sync {
    /// Name of the engine (for logging)
    fn name(&self) -> &'static str;

    /// One-time setup, called before the first extraction. A failure is
    /// reported and retried on the next extraction.
    fn initialize(&self) -> Result<(), EngineError>;

    /// Info-extraction entry point. All page requests go through `network`.
    fn extract_info(
        &self,
        url: &str,
        options: &EngineOptions,
        network: &dyn NetworkAccess,
    ) -> Result<Value, EngineError>;
}

/// Alternate extractor for restricted domains, tried by the session when the
/// orchestrator fails
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, url: &str) -> Result<ExtractionResult, EngineError>;
}

/// Decode an engine's JSON info dict into an `ExtractionResult` for `url`.
/// `fetched_at` is left at 0 for the cache write to set.
pub fn decode_engine_result(url: &str, json: &Value) -> Result<ExtractionResult, String> {
    if !json.is_object() {
        return Err("expected a JSON object".to_string());
    }

    let formats = match json.get("formats") {
        Some(Value::Array(items)) => items.iter().map(decode_format).collect(),
        Some(Value::Null) | None => single_format(json).into_iter().collect(),
        Some(_) => return Err("`formats` is not an array".to_string()),
    };

    Ok(ExtractionResult {
        url: url.to_string(),
        title: json["title"].as_str().unwrap_or("Unknown").to_string(),
        duration_seconds: json["duration"].as_f64().map_or(0, |d| d.max(0.0) as u64),
        uploader: string_field(json, "uploader"),
        thumbnail_url: string_field(json, "thumbnail"),
        formats,
        fetched_at: 0,
    })
}

fn string_field(json: &Value, key: &str) -> Option<String> {
    json[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn decode_format(f: &Value) -> FormatDescriptor {
    FormatDescriptor {
        format_id: match &f["format_id"] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        },
        extension: f["ext"].as_str().unwrap_or("").to_string(),
        url: f["url"].as_str().unwrap_or("").to_string(),
        video_codec: string_field(f, "vcodec"),
        audio_codec: string_field(f, "acodec"),
        width: f["width"].as_u64().map(|w| w as u32),
        height: f["height"].as_u64().map(|h| h as u32),
        resolution_label: string_field(f, "resolution"),
        fps: f["fps"].as_f64().map(|fps| fps as f32),
        filesize_bytes: f["filesize"]
            .as_u64()
            .or_else(|| f["filesize_approx"].as_f64().map(|s| s as u64)),
        format_note: string_field(f, "format_note"),
    }
}

/// Single-format results carry the format fields at the top level
fn single_format(json: &Value) -> Option<FormatDescriptor> {
    json["url"].as_str()?;
    let mut format = decode_format(json);
    if format.format_id.is_empty() {
        format.format_id = "0".to_string();
    }
    Some(format)
}
