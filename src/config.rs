// Pipeline configuration (YAML)
//
// Every field has a default, so an empty document is a valid config.
// `${VAR}` references are replaced with environment values before parsing.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloader::http::SpoofHeaders;

lazy_static! {
    static ref ENV_REF: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Environment variable '{0}' is referenced but not set")]
    MissingEnv(String),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite file; defaults to the user cache directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

fn default_primary() -> String {
    "https://corsproxy.io/?".to_string()
}

fn default_secondary() -> String {
    "https://api.allorigins.win/raw?url=".to_string()
}

fn default_restricted_domains() -> Vec<String> {
    [
        "youtube.com",
        "youtu.be",
        "vimeo.com",
        "tiktok.com",
        "instagram.com",
        "twitter.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_direct_blocked_domains() -> Vec<String> {
    vec!["youtube.com".to_string(), "youtu.be".to_string()]
}

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn default_direct_headers() -> SpoofHeaders {
    SpoofHeaders {
        user_agent: BROWSER_USER_AGENT.to_string(),
        referer: "https://www.google.com".to_string(),
        origin: None,
        accept: None,
    }
}

fn default_edge_headers() -> SpoofHeaders {
    SpoofHeaders {
        user_agent: BROWSER_USER_AGENT.to_string(),
        referer: "https://www.youtube.com".to_string(),
        origin: Some("https://www.youtube.com".to_string()),
        accept: Some(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ),
    }
}

/// Proxy endpoints and spoofing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Primary mirror base; the percent-encoded target is appended
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_secondary")]
    pub secondary: String,
    /// Hosts (and subdomains) rewritten by the edge proxy
    #[serde(default = "default_restricted_domains")]
    pub restricted_domains: Vec<String>,
    /// Hosts where the direct ladder strategy is skipped
    #[serde(default = "default_direct_blocked_domains")]
    pub direct_blocked_domains: Vec<String>,
    #[serde(default = "default_direct_headers")]
    pub direct_headers: SpoofHeaders,
    #[serde(default = "default_edge_headers")]
    pub edge_headers: SpoofHeaders,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: default_secondary(),
            restricted_domains: default_restricted_domains(),
            direct_blocked_domains: default_direct_blocked_domains(),
            direct_headers: default_direct_headers(),
            edge_headers: default_edge_headers(),
        }
    }
}

/// How the yt-dlp engine is launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Python module first, zipapp as fallback
    #[default]
    Auto,
    /// yt-dlp zipapp release, imported by the Python interpreter
    Binary,
    Python,
}

fn default_extraction_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub engine: EngineKind,
    /// yt-dlp zipapp for the binary engine
    #[serde(default)]
    pub ytdlp_path: Option<String>,
    /// Python interpreter running the engine
    #[serde(default)]
    pub python: Option<String>,
    #[serde(default = "default_extraction_timeout")]
    pub timeout_seconds: u64,
    /// Proxy for the engine requests the ladder cannot serve (those with a body)
    #[serde(default)]
    pub upstream_proxy: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Auto,
            ytdlp_path: None,
            python: None,
            timeout_seconds: default_extraction_timeout(),
            upstream_proxy: None,
        }
    }
}

fn default_transcode_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_seconds: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            transcode_timeout_seconds: default_transcode_timeout(),
        }
    }
}

fn default_network_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-request timeout for proxy ladder fetches
    #[serde(default = "default_network_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// SOCKS5/HTTP proxy URL for all client traffic
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_network_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl PipelineConfig {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, ConfigError> {
        // Every referenced variable must exist
        for caps in ENV_REF.captures_iter(yaml) {
            let name = &caps[1];
            if std::env::var(name).is_err() {
                return Err(ConfigError::MissingEnv(name.to_string()));
            }
        }

        let substituted = ENV_REF.replace_all(yaml, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        });

        // An empty document parses as null
        if substituted.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&substituted)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, base) in [
            ("proxy.primary", &self.proxy.primary),
            ("proxy.secondary", &self.proxy.secondary),
        ] {
            let url = Url::parse(base)
                .map_err(|e| ConfigError::Invalid(format!("{} '{}': {}", name, base, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::Invalid(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, base
                )));
            }
        }

        for (name, value) in [
            ("cache.ttl_seconds", self.cache.ttl_seconds),
            ("extraction.timeout_seconds", self.extraction.timeout_seconds),
            (
                "transfer.transcode_timeout_seconds",
                self.transfer.transcode_timeout_seconds,
            ),
            ("network.timeout_seconds", self.network.timeout_seconds),
            (
                "network.connect_timeout_seconds",
                self.network.connect_timeout_seconds,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        if let Some(proxy) = &self.network.proxy {
            Url::parse(proxy)
                .map_err(|e| ConfigError::Invalid(format!("network.proxy '{}': {}", proxy, e)))?;
        }

        Ok(())
    }
}
