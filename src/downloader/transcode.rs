// FFmpeg transcoder - audio extraction to MP3 over stdin/stdout

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::errors::TranscodeError;
use super::traits::Transcoder;
use super::utils::{locate_program, run_output_with_timeout};
use crate::config::TransferConfig;

pub const MP3_MIME: &str = "audio/mpeg";

/// Transcoder over the `ffmpeg` CLI. The program is located on first use,
/// never at construction.
pub struct FfmpegTranscoder {
    configured_path: Option<String>,
    ffmpeg_path: OnceCell<String>,
    timeout_seconds: u64,
}

impl FfmpegTranscoder {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            configured_path: config.ffmpeg_path.clone(),
            ffmpeg_path: OnceCell::new(),
            timeout_seconds: config.transcode_timeout_seconds,
        }
    }

    /// Configured path, else a well-known location or `which ffmpeg`.
    /// The lookup may spawn a process, so it runs on the blocking pool.
    async fn ffmpeg_path(&self) -> &str {
        self.ffmpeg_path
            .get_or_init(|| async {
                if let Some(path) = &self.configured_path {
                    return path.clone();
                }
                tokio::task::spawn_blocking(|| {
                    locate_program(
                        "ffmpeg",
                        &[
                            "/opt/homebrew/bin/ffmpeg",
                            "/usr/local/bin/ffmpeg",
                            "/usr/bin/ffmpeg",
                        ],
                    )
                })
                .await
                .unwrap_or_else(|_| "ffmpeg".to_string())
            })
            .await
    }

    fn build_args() -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-q:a",
            "2",
            "-f",
            "mp3",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn transcode(&self, bytes: Bytes, source_mime: &str) -> Result<Bytes, TranscodeError> {
        let ffmpeg = self.ffmpeg_path().await;
        debug!(ffmpeg, source_mime, input = bytes.len(), "Transcoding to MP3");

        let output = run_output_with_timeout(
            ffmpeg,
            Self::build_args(),
            Some(bytes.to_vec()),
            self.timeout_seconds,
        )
        .await
        .map_err(|e| {
            if e.starts_with("Failed to start") {
                TranscodeError::NotAvailable(e)
            } else {
                TranscodeError::Failed(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TranscodeError::Failed(if stderr.is_empty() {
                format!("ffmpeg exited with {}", output.status)
            } else {
                stderr
            }));
        }
        if output.stdout.is_empty() {
            return Err(TranscodeError::Failed("ffmpeg produced no output".to_string()));
        }

        info!(output = output.stdout.len(), "Transcoded to MP3");
        Ok(Bytes::from(output.stdout))
    }
}
