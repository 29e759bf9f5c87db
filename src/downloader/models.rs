// Common data models for the acquisition pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio/video classification of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One downloadable variant of a media resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Engine format ID (e.g., "18", "140")
    pub format_id: String,
    /// Container extension (mp4, webm, m4a)
    pub extension: String,
    /// Direct media URL
    pub url: String,
    /// Video codec, "none" for audio-only streams
    pub video_codec: Option<String>,
    /// Audio codec, "none" for video-only streams
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Resolution label (e.g., "1920x1080", "audio only")
    pub resolution_label: Option<String>,
    pub fps: Option<f32>,
    /// Exact size when known, otherwise the engine's estimate
    pub filesize_bytes: Option<u64>,
    /// Format note (e.g., "1080p", "medium")
    pub format_note: Option<String>,
}

impl FormatDescriptor {
    /// A format can be offered only with a resolvable URL and an extension
    pub fn is_presentable(&self) -> bool {
        !self.url.trim().is_empty() && !self.extension.trim().is_empty()
    }

    /// `video_codec == "none"` marks audio-only
    pub fn kind(&self) -> MediaKind {
        match self.video_codec.as_deref() {
            Some("none") => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        self.kind() == MediaKind::Audio
    }

    /// Audio extraction (transcode to MP3) is offered for audio-only streams
    pub fn offers_audio_extraction(&self) -> bool {
        self.is_audio_only()
    }

    /// Check if format is H.264 (avc1)
    pub fn is_h264(&self) -> bool {
        self.video_codec
            .as_deref()
            .map_or(false, |v| v.starts_with("avc1"))
    }

    pub fn is_vp9(&self) -> bool {
        self.video_codec
            .as_deref()
            .map_or(false, |v| v.starts_with("vp9") || v.starts_with("vp09"))
    }

    pub fn is_av1(&self) -> bool {
        self.video_codec
            .as_deref()
            .map_or(false, |v| v.starts_with("av01"))
    }

    /// Check if audio is AAC (m4a)
    pub fn is_aac(&self) -> bool {
        self.audio_codec
            .as_deref()
            .map_or(false, |a| a.starts_with("mp4a"))
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec
            .as_deref()
            .map_or(false, |a| a != "none" && !a.is_empty())
    }

    /// Resolution for display: the label, else WxH
    pub fn display_resolution(&self) -> Option<String> {
        if let Some(label) = &self.resolution_label {
            return Some(label.clone());
        }
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }

    /// MIME type implied by the container extension
    pub fn guess_mime(&self) -> &'static str {
        match self.extension.to_ascii_lowercase().as_str() {
            "mp4" => "video/mp4",
            "webm" if self.is_audio_only() => "audio/webm",
            "webm" => "video/webm",
            "m4a" => "audio/mp4",
            "mp3" => "audio/mpeg",
            "opus" | "ogg" => "audio/ogg",
            "3gp" => "video/3gpp",
            "flv" => "video/x-flv",
            "mkv" => "video/x-matroska",
            _ => "application/octet-stream",
        }
    }
}

/// Metadata and formats for one media resource. Cached as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Canonical resource URL (cache key)
    pub url: String,
    pub title: String,
    pub duration_seconds: u64,
    pub uploader: Option<String>,
    pub thumbnail_url: Option<String>,
    pub formats: Vec<FormatDescriptor>,
    /// Unix milliseconds, set when the result is written to the cache
    pub fetched_at: i64,
}

impl ExtractionResult {
    /// Formats with a URL and an extension, in engine order
    pub fn presentable_formats(&self) -> impl Iterator<Item = &FormatDescriptor> {
        self.formats.iter().filter(|f| f.is_presentable())
    }

    pub fn find_format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}

/// Live transfer progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// 0..=100, stays 0 when the total is unknown
    pub percent: f64,
    pub bytes_loaded: u64,
    pub bytes_per_second: f64,
    pub eta_seconds: Option<f64>,
}

/// Finished download, tagged with its MIME type
#[derive(Clone, PartialEq)]
pub struct Artifact {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl Artifact {
    pub fn new(bytes: Bytes, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension for saving, from the MIME subtype ("audio/mpeg" -> "mpeg")
    pub fn extension_hint(&self) -> &str {
        match self.mime_type.as_str() {
            "audio/mpeg" => "mp3",
            "audio/mp4" => "m4a",
            other => other
                .split('/')
                .nth(1)
                .and_then(|s| s.split(';').next())
                .unwrap_or("bin"),
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Events delivered to a transfer's progress sink, in order. Exactly one
/// terminal event (`Completed`, `Cancelled`, `Failed`) ends the sequence.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(TransferProgress),
    Completed { total_bytes: u64, mime_type: String },
    Cancelled,
    Failed(crate::downloader::errors::TransferError),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}
