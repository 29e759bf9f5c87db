// CLI surface: `info` and `download` over one Media Session

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::downloader::format_selector::{FormatFilter, FormatSelector};
use crate::downloader::models::{ExtractionResult, FormatDescriptor, TransferEvent};
use crate::downloader::session::MediaSession;
use crate::downloader::traits::ProgressSink;
use crate::downloader::transfer::TransferOptions;
use crate::downloader::utils::{format_duration, format_file_size};

#[derive(Parser)]
#[command(name = "media-downloader")]
#[command(about = "Resolve media formats and download them across origin restrictions")]
#[command(version)]
pub struct Cli {
    /// YAML config file
    #[arg(long, short, global = true, env = "MEDIA_DOWNLOADER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON (stderr)
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Debug-level logs
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show metadata and downloadable formats
    Info {
        url: String,

        /// Which formats to list
        #[arg(long, value_enum, default_value_t = FormatFilter::All)]
        filter: FormatFilter,

        /// Print the result as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Download one format
    Download {
        url: String,

        /// Format ID, "best", or "audio"
        #[arg(long, short, default_value = "best")]
        format: String,

        /// Extract audio to MP3 (needs ffmpeg)
        #[arg(long)]
        mp3: bool,

        /// Output file (default: title + extension in the current directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let session = MediaSession::builder(config)
        .build()
        .context("Failed to start media session")?;

    let outcome = match cli.command {
        Commands::Info { url, filter, json } => run_info(&session, &url, filter, json).await,
        Commands::Download {
            url,
            format,
            mp3,
            output,
        } => run_download(&session, &url, &format, mp3, output).await,
    };

    session.shutdown();
    outcome
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    #[serde(flatten)]
    result: &'a ExtractionResult,
    recommended: Option<&'a str>,
}

async fn extract(session: &MediaSession, url: &str) -> Result<ExtractionResult> {
    session
        .extract(url)
        .await
        .map_err(|e| anyhow!(e.status_message()))
}

async fn run_info(session: &MediaSession, url: &str, filter: FormatFilter, json: bool) -> Result<()> {
    let mut result = extract(session, url).await?;
    result.formats = FormatSelector::filter(&result, filter)
        .into_iter()
        .cloned()
        .collect();
    let recommended = FormatSelector::recommend(&result).map(|f| f.format_id.clone());

    if json {
        let output = InfoOutput {
            result: &result,
            recommended: recommended.as_deref(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", result.title);
    println!("  Duration: {}", format_duration(result.duration_seconds));
    if let Some(uploader) = &result.uploader {
        println!("  Uploader: {}", uploader);
    }
    println!();
    if result.formats.is_empty() {
        println!("No downloadable formats");
        return Ok(());
    }
    for format in &result.formats {
        let marker = if recommended.as_deref() == Some(format.format_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:>8}  {:<40} {}",
            marker,
            format.format_id,
            FormatSelector::label(format),
            FormatSelector::codec_label(format)
        );
    }
    Ok(())
}

async fn run_download(
    session: &MediaSession,
    url: &str,
    selector: &str,
    mp3: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let result = extract(session, url).await?;

    // MP3 extraction works from an audio-only stream
    let selector = if mp3 && selector == "best" { "audio" } else { selector };
    let format = FormatSelector::select(&result, selector)
        .ok_or_else(|| anyhow!("No format matches '{}'. Run `info` to list formats.", selector))?
        .clone();
    if mp3 && !format.offers_audio_extraction() {
        bail!(
            "Format {} is not audio-only; pick an audio format or use --format audio",
            format.format_id
        );
    }

    info!(format_id = %format.format_id, label = %FormatSelector::label(&format), "Downloading");
    let sink: Arc<dyn ProgressSink> = Arc::new(print_progress);
    let handle = session.start_transfer(&format, TransferOptions { transcode: mp3 }, sink);

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            handle.wait().await
        }
    };
    eprintln!();

    let artifact = match outcome {
        Ok(artifact) => artifact,
        Err(err) => match err.recovered_artifact() {
            Some(original) => {
                warn!(error = %err, "Post-processing failed, keeping the original");
                eprintln!("{}", err.status_message());
                original.clone()
            }
            None if err.is_cancelled() => {
                eprintln!("{}", err.status_message());
                return Ok(());
            }
            None => bail!(err.status_message()),
        },
    };

    let path = output.unwrap_or_else(|| default_output(&result, &format, artifact.extension_hint()));
    tokio::fs::write(&path, &artifact.bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!(
        "Saved {} ({}, {})",
        path.display(),
        format_file_size(artifact.len() as u64),
        artifact.mime_type
    );
    Ok(())
}

fn print_progress(event: TransferEvent) {
    if let TransferEvent::Progress(p) = event {
        let speed = format!("{}/s", format_file_size(p.bytes_per_second as u64));
        let loaded = format_file_size(p.bytes_loaded);
        match p.eta_seconds {
            _ if p.percent <= 0.0 => eprint!("\r{} at {}          ", loaded, speed),
            Some(eta) => eprint!(
                "\r{:5.1}% {} at {} ETA {}          ",
                p.percent,
                loaded,
                speed,
                format_duration(eta.round() as u64)
            ),
            None => eprint!("\r{:5.1}% {} at {}          ", p.percent, loaded, speed),
        }
    }
}

fn default_output(result: &ExtractionResult, format: &FormatDescriptor, mime_ext: &str) -> PathBuf {
    let ext = if format.extension.is_empty() || mime_ext == "mp3" {
        mime_ext
    } else {
        format.extension.as_str()
    };
    Path::new(".").join(format!("{}.{}", sanitize_file_name(&result.title), ext))
}

/// Title reduced to characters safe in file names
fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}
