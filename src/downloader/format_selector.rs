// FormatSelector - format filtering, labels and best-format selection
//
// Works on the presentable formats of an ExtractionResult:
// - Audio/video filtering (`video_codec == "none"` is audio)
// - Display labels (note, resolution, container, size, fps)
// - Best quality detection with H.264/AAC preference for compatibility
//
// The Transfer Engine fetches one format as-is, so "best" prefers formats
// that carry both video and audio.

use serde::{Deserialize, Serialize};

use super::models::{ExtractionResult, FormatDescriptor, MediaKind};
use super::utils::format_file_size;

/// Which formats to list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormatFilter {
    #[default]
    All,
    Audio,
    Video,
}

impl FormatFilter {
    pub fn accepts(&self, format: &FormatDescriptor) -> bool {
        match self {
            Self::All => true,
            Self::Audio => format.kind() == MediaKind::Audio,
            Self::Video => format.kind() == MediaKind::Video,
        }
    }
}

pub struct FormatSelector;

impl FormatSelector {
    /// Presentable formats passing `filter`, in engine order
    pub fn filter(result: &ExtractionResult, filter: FormatFilter) -> Vec<&FormatDescriptor> {
        result
            .presentable_formats()
            .filter(|f| filter.accepts(f))
            .collect()
    }

    /// Display label, e.g. "720p 1280x720 MP4 12.40 MB 30fps"
    pub fn label(format: &FormatDescriptor) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(note) = format.format_note.as_deref().filter(|n| !n.is_empty()) {
            parts.push(note.to_string());
        }
        if format.is_audio_only() {
            parts.push("audio only".to_string());
        } else if let Some(resolution) = format.display_resolution() {
            if parts.first() != Some(&resolution) {
                parts.push(resolution);
            }
        }
        parts.push(format.extension.to_uppercase());
        if let Some(size) = format.filesize_bytes {
            parts.push(format_file_size(size));
        }
        if let Some(fps) = format.fps.filter(|f| *f > 0.0) {
            parts.push(format!("{}fps", fps.round() as u32));
        }
        parts.join(" ")
    }

    /// Human-readable codec label
    pub fn codec_label(format: &FormatDescriptor) -> String {
        if format.is_audio_only() {
            return match format.audio_codec.as_deref() {
                Some(a) if a.starts_with("mp4a") => "AAC".to_string(),
                Some(a) if a.starts_with("opus") => "Opus".to_string(),
                Some(a) => a.split('.').next().unwrap_or(a).to_string(),
                None => "Unknown".to_string(),
            };
        }
        if format.is_h264() {
            "H.264".to_string()
        } else if format.is_vp9() {
            "VP9".to_string()
        } else if format.is_av1() {
            "AV1".to_string()
        } else {
            format
                .video_codec
                .as_deref()
                .map(|v| v.split('.').next().unwrap_or(v).to_string())
                .unwrap_or_else(|| "Unknown".to_string())
        }
    }

    /// Best video format (highest resolution with H.264 preference). Formats
    /// with an audio track win over video-only ones.
    pub fn find_best_video<'a>(formats: &[&'a FormatDescriptor]) -> Option<&'a FormatDescriptor> {
        let video: Vec<&FormatDescriptor> = formats
            .iter()
            .copied()
            .filter(|f| f.kind() == MediaKind::Video)
            .collect();
        let muxed: Vec<&FormatDescriptor> = video.iter().copied().filter(|f| f.has_audio()).collect();
        let pool = if muxed.is_empty() { video } else { muxed };

        let best_any = pool.iter().copied().max_by_key(|f| f.height.unwrap_or(0));
        let best_h264 = pool
            .iter()
            .copied()
            .filter(|f| f.is_h264())
            .max_by_key(|f| f.height.unwrap_or(0));

        match (best_h264, best_any) {
            (Some(h264), Some(any)) => {
                // A much higher resolution in another codec (4K vs 1080p) wins
                let h264_height = h264.height.unwrap_or(0);
                if any.height.unwrap_or(0) > h264_height * 3 / 2 {
                    Some(any)
                } else {
                    Some(h264)
                }
            }
            (None, any) => any,
            (h264, None) => h264,
        }
    }

    /// Best audio-only format (prefer AAC for compatibility, then size)
    pub fn find_best_audio<'a>(formats: &[&'a FormatDescriptor]) -> Option<&'a FormatDescriptor> {
        let audio = formats.iter().copied().filter(|f| f.is_audio_only());
        let best_aac = audio
            .clone()
            .filter(|f| f.is_aac())
            .max_by_key(|f| f.filesize_bytes.unwrap_or(0));
        best_aac.or_else(|| audio.max_by_key(|f| f.filesize_bytes.unwrap_or(0)))
    }

    /// Resolve a selector: "best", "audio", or a format ID
    pub fn select<'a>(result: &'a ExtractionResult, selector: &str) -> Option<&'a FormatDescriptor> {
        let presentable = Self::filter(result, FormatFilter::All);
        match selector {
            "best" => Self::find_best_video(&presentable).or_else(|| presentable.first().copied()),
            "audio" => Self::find_best_audio(&presentable),
            id => result.find_format(id).filter(|f| f.is_presentable()),
        }
    }

    /// Format shown as recommended: best H.264 (or other) muxed video
    pub fn recommend(result: &ExtractionResult) -> Option<&FormatDescriptor> {
        let presentable = Self::filter(result, FormatFilter::Video);
        Self::find_best_video(&presentable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_video_format(height: u32, vcodec: &str, acodec: &str, size: u64) -> FormatDescriptor {
        FormatDescriptor {
            format_id: format!("{}-{}", height, vcodec),
            extension: "mp4".to_string(),
            url: format!("https://cdn.example/{}.mp4", height),
            video_codec: Some(vcodec.to_string()),
            audio_codec: Some(acodec.to_string()),
            width: Some(height * 16 / 9),
            height: Some(height),
            resolution_label: None,
            fps: Some(30.0),
            filesize_bytes: Some(size),
            format_note: Some(format!("{}p", height)),
        }
    }

    fn make_audio_format(id: &str, acodec: &str, size: u64) -> FormatDescriptor {
        FormatDescriptor {
            format_id: id.to_string(),
            extension: "m4a".to_string(),
            url: format!("https://cdn.example/{}.m4a", id),
            video_codec: Some("none".to_string()),
            audio_codec: Some(acodec.to_string()),
            width: None,
            height: None,
            resolution_label: Some("audio only".to_string()),
            fps: None,
            filesize_bytes: Some(size),
            format_note: None,
        }
    }

    fn result(formats: Vec<FormatDescriptor>) -> ExtractionResult {
        ExtractionResult {
            url: "https://video.example/watch?id=1".to_string(),
            title: "Demo".to_string(),
            duration_seconds: 10,
            uploader: None,
            thumbnail_url: None,
            formats,
            fetched_at: 0,
        }
    }

    #[test]
    fn test_h264_preference() {
        let formats = vec![
            make_video_format(1080, "vp9", "opus", 150_000_000),
            make_video_format(1080, "avc1.4d401f", "mp4a.40.2", 100_000_000),
        ];
        let refs: Vec<&FormatDescriptor> = formats.iter().collect();
        let best = FormatSelector::find_best_video(&refs).unwrap();
        assert!(best.is_h264());
    }

    #[test]
    fn test_much_higher_resolution_beats_h264() {
        let formats = vec![
            make_video_format(2160, "vp9", "opus", 900_000_000),
            make_video_format(1080, "avc1.4d401f", "mp4a.40.2", 100_000_000),
        ];
        let refs: Vec<&FormatDescriptor> = formats.iter().collect();
        assert_eq!(FormatSelector::find_best_video(&refs).unwrap().height, Some(2160));
    }

    #[test]
    fn test_muxed_formats_win_over_video_only() {
        let formats = vec![
            make_video_format(1080, "avc1.640028", "none", 100_000_000),
            make_video_format(360, "avc1.42001E", "mp4a.40.2", 10_000_000),
        ];
        let refs: Vec<&FormatDescriptor> = formats.iter().collect();
        assert_eq!(FormatSelector::find_best_video(&refs).unwrap().height, Some(360));
    }

    #[test]
    fn test_audio_filter_and_best_audio() {
        let r = result(vec![
            make_video_format(720, "avc1", "mp4a.40.2", 50_000_000),
            make_audio_format("251", "opus", 6_000_000),
            make_audio_format("140", "mp4a.40.2", 5_000_000),
        ]);
        let audio = FormatSelector::filter(&r, FormatFilter::Audio);
        assert_eq!(audio.len(), 2);
        assert_eq!(FormatSelector::filter(&r, FormatFilter::Video).len(), 1);
        assert_eq!(FormatSelector::select(&r, "audio").unwrap().format_id, "140");
    }

    #[test]
    fn test_select_by_id_ignores_unpresentable() {
        let mut broken = make_video_format(480, "avc1", "mp4a.40.2", 1);
        broken.format_id = "18".to_string();
        broken.url = String::new();
        let r = result(vec![broken]);
        assert!(FormatSelector::select(&r, "18").is_none());
        assert!(FormatSelector::select(&r, "best").is_none());
    }

    #[test]
    fn test_labels() {
        let video = make_video_format(720, "avc1.4d401f", "mp4a.40.2", 1_048_576);
        assert_eq!(FormatSelector::label(&video), "720p 1280x720 MP4 1.00 MB 30fps");
        assert_eq!(FormatSelector::codec_label(&video), "H.264");

        let audio = make_audio_format("140", "mp4a.40.2", 2048);
        assert_eq!(FormatSelector::label(&audio), "audio only M4A 2.00 KB");
        assert_eq!(FormatSelector::codec_label(&audio), "AAC");
    }
}
