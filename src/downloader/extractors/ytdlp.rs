// yt-dlp engine binding - runs yt-dlp as an isolated child process
//
// The child is a Python interpreter running RELAY_SCRIPT: a `YoutubeDL`
// subclass whose `urlopen` asks the host for every GET it makes, so page and
// API fetches go through `NetworkAccess` (and from there the Proxy Ladder).
// Requests carrying a body are not expressible as a fetch and use yt-dlp's
// own networking with the configured upstream proxy.
//
// Two ways of finding yt-dlp:
// - Python mode: the installed `yt_dlp` module (tracks upstream fixes fastest)
// - Binary mode: a `yt-dlp` zipapp release, imported from its path
//
// Auto mode prefers Python and falls back to the binary.

use std::sync::OnceLock;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::relay::{run_relay, EngineCommand};
use super::traits::{EngineOptions, ExtractionEngine, NetworkAccess};
use crate::config::{EngineKind, ExtractionConfig};
use crate::downloader::errors::EngineError;
use crate::downloader::utils::{locate_program, program_responds};

/// Set for binary mode; the relay script imports yt_dlp from this path
const YTDLP_PATH_ENV: &str = "MEDIA_DOWNLOADER_YTDLP_PATH";

/// argv: <params-json> <url>
const RELAY_SCRIPT: &str = r#"
import io, json, os, sys

_path = os.environ.get("MEDIA_DOWNLOADER_YTDLP_PATH")
if _path:
    sys.path.insert(0, _path)

from yt_dlp import YoutubeDL
from yt_dlp.networking import Request, Response
from yt_dlp.networking.exceptions import TransportError

_channel = sys.stdout
sys.stdout = sys.stderr
_replies = sys.stdin.buffer
_next_id = 0


def _send(message):
    _channel.write(json.dumps(message) + "\n")
    _channel.flush()


class RelayedYoutubeDL(YoutubeDL):
    def urlopen(self, req):
        global _next_id
        if isinstance(req, str):
            req = Request(req)
        if not isinstance(req, Request) or req.method != "GET" or req.data is not None:
            return super().urlopen(req)
        _next_id += 1
        _send({"type": "fetch", "id": _next_id, "url": req.url})
        reply = json.loads(_replies.readline())
        if not reply.get("ok"):
            raise TransportError(reply.get("error") or "fetch failed")
        body = _replies.read(reply["length"])
        return Response(io.BytesIO(body), req.url, {}, status=200)


def main():
    params = json.loads(sys.argv[1])
    try:
        with RelayedYoutubeDL(params) as ydl:
            info = ydl.extract_info(sys.argv[2], download=False)
            _send({"type": "result", "info": ydl.sanitize_info(info)})
    except Exception as exc:
        _send({"type": "error", "message": str(exc)})


main()
"#;

pub struct YtDlpEngine {
    kind: EngineKind,
    ytdlp_path: Option<String>,
    python: Option<String>,
    timeout_seconds: u64,
    command: OnceLock<EngineCommand>,
}

impl YtDlpEngine {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            kind: config.engine,
            ytdlp_path: config.ytdlp_path.clone(),
            python: config.python.clone(),
            timeout_seconds: config.timeout_seconds,
            command: OnceLock::new(),
        }
    }

    /// Engine with a fixed launch command that speaks the relay protocol
    pub fn with_command(command: EngineCommand, timeout_seconds: u64) -> Self {
        let engine = Self {
            kind: EngineKind::Auto,
            ytdlp_path: None,
            python: None,
            timeout_seconds,
            command: OnceLock::new(),
        };
        let _ = engine.command.set(command);
        engine
    }

    /// Find yt-dlp binary
    fn find_ytdlp(&self) -> String {
        if let Some(path) = &self.ytdlp_path {
            return path.clone();
        }
        locate_program(
            "yt-dlp",
            &[
                "/opt/homebrew/bin/yt-dlp", // Homebrew on Apple Silicon
                "/usr/local/bin/yt-dlp",    // Homebrew on Intel Mac
                "/usr/bin/yt-dlp",          // System installation
            ],
        )
    }

    /// Find Python interpreter
    fn find_python(&self) -> String {
        if let Some(python) = &self.python {
            return python.clone();
        }
        // Allow override via environment variable
        if let Ok(custom) = std::env::var("YTDLP_PYTHON") {
            return custom;
        }
        for cmd in ["python3", "/opt/homebrew/bin/python3", "/usr/local/bin/python3"] {
            if program_responds(cmd, &["--version"]) {
                return cmd.to_string();
            }
        }
        "python3".to_string()
    }

    fn python_command(&self) -> Option<EngineCommand> {
        let python = self.find_python();
        program_responds(&python, &["-c", "import yt_dlp"])
            .then(|| EngineCommand::new(python, ["-c", RELAY_SCRIPT]))
    }

    fn binary_command(&self) -> Option<EngineCommand> {
        let path = self.find_ytdlp();
        let python = self.find_python();
        program_responds(
            &python,
            &["-c", "import sys; sys.path.insert(0, sys.argv[1]); import yt_dlp", path.as_str()],
        )
        .then(|| EngineCommand::new(python, ["-c", RELAY_SCRIPT]).with_env(YTDLP_PATH_ENV, path))
    }

    fn resolve_command(&self) -> Result<EngineCommand, EngineError> {
        let found = match self.kind {
            EngineKind::Python => self.python_command(),
            EngineKind::Binary => self.binary_command(),
            EngineKind::Auto => self.python_command().or_else(|| self.binary_command()),
        };
        found.ok_or_else(|| {
            EngineError::NotAvailable(match self.kind {
                EngineKind::Python => "Python yt_dlp module not installed".to_string(),
                EngineKind::Binary => {
                    "yt-dlp zipapp not found or not importable by Python".to_string()
                }
                EngineKind::Auto => {
                    "neither the yt_dlp Python module nor a yt-dlp zipapp was found".to_string()
                }
            })
        })
    }

    /// `YoutubeDL` parameters for one extraction
    pub fn ydl_params(options: &EngineOptions) -> Value {
        let headers: Map<String, Value> = options
            .http_headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        let mut params = json!({
            "quiet": options.quiet,
            "no_warnings": options.no_warnings,
            "extract_flat": options.extract_flat,
            "force_generic_extractor": options.force_generic_extractor,
            "skip_download": !options.download,
            "noplaylist": true,
            "http_headers": headers,
        });
        if let Some(proxy) = &options.proxy {
            params["proxy"] = Value::String(proxy.clone());
        }
        params
    }
}

impl ExtractionEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn initialize(&self) -> Result<(), EngineError> {
        if self.command.get().is_some() {
            return Ok(());
        }
        let command = self.resolve_command()?;
        info!(program = %command.program, env = ?command.env, "yt-dlp engine ready");
        let _ = self.command.set(command);
        Ok(())
    }

    fn extract_info(
        &self,
        url: &str,
        options: &EngineOptions,
        network: &dyn NetworkAccess,
    ) -> Result<Value, EngineError> {
        let command = match self.command.get() {
            Some(command) => command.clone(),
            None => self.resolve_command()?,
        };
        let params = Self::ydl_params(options);
        debug!(program = %command.program, url, "Running yt-dlp");

        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Launch(format!("no async runtime: {}", e)))?;
        run_relay(
            &runtime,
            &command,
            &params,
            url,
            network,
            Duration::from_secs(self.timeout_seconds),
        )
    }
}
