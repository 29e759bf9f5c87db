// Engine relay - serves an engine child process's network requests through
// `NetworkAccess`
//
// The child writes newline-delimited JSON to stdout:
//   {"type":"fetch","id":1,"url":"..."}   needs the content of a URL
//   {"type":"result","info":{...}}        final info dict
//   {"type":"error","message":"..."}      extraction failed
// Every fetch is answered on stdin with one JSON line, followed by exactly
// `length` body bytes when `ok`:
//   {"id":1,"ok":true,"length":N}
//   {"id":1,"ok":false,"error":"..."}
// Other stdout lines are logged and ignored.
//
// The host side runs on the extraction's blocking thread (the only place
// `NetworkAccess::fetch` may be called). Child I/O runs as a task on the
// runtime and talks to the host over channels.

use std::process::Stdio;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::NetworkAccess;
use crate::downloader::errors::EngineError;

/// How to launch an engine child that speaks the relay protocol. The
/// parameters JSON and the URL are appended as the last two arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub prefix_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl EngineCommand {
    pub fn new<I, S>(program: impl Into<String>, prefix_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ChildMessage {
    Fetch { id: u64, url: String },
    Result { info: Value },
    Error { message: String },
}

#[derive(Debug, Serialize)]
struct FetchReply<'a> {
    id: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

enum ChildEvent {
    Line(String),
    Exited { status: String, stderr: String },
    Failed(EngineError),
}

/// Run one extraction in `command`, answering its fetches through `network`.
/// The child is killed when this returns, whatever the outcome.
///
/// Must be called from a blocking-pool thread, never from async context.
pub fn run_relay(
    runtime: &Handle,
    command: &EngineCommand,
    params: &Value,
    url: &str,
    network: &dyn NetworkAccess,
    timeout: Duration,
) -> Result<Value, EngineError> {
    let mut args = command.prefix_args.clone();
    args.push(params.to_string());
    args.push(url.to_string());

    let (event_tx, event_rx) = std_mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let _kill_on_return = stop.clone().drop_guard();
    runtime.spawn(pump_child(command.clone(), args, event_tx, reply_rx, stop));

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = match event_rx.recv_timeout(remaining) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                return Err(EngineError::Reported(format!(
                    "Timed out after {}s",
                    timeout.as_secs()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EngineError::Launch("engine relay stopped unexpectedly".to_string()))
            }
        };

        match event {
            ChildEvent::Line(line) => match serde_json::from_str::<ChildMessage>(&line) {
                Ok(ChildMessage::Fetch { id, url }) => {
                    let frame = answer(id, &url, network);
                    if reply_tx.send(frame).is_err() {
                        return Err(EngineError::Launch(
                            "engine exited while a request was in flight".to_string(),
                        ));
                    }
                }
                Ok(ChildMessage::Result { info }) => return Ok(info),
                Ok(ChildMessage::Error { message }) => return Err(EngineError::Reported(message)),
                Err(_) => debug!(line = %line, "Engine output"),
            },
            ChildEvent::Exited { status, stderr } => {
                return Err(EngineError::Reported(if stderr.is_empty() {
                    format!("engine exited with {} before reporting a result", status)
                } else {
                    stderr
                }))
            }
            ChildEvent::Failed(e) => return Err(e),
        }
    }
}

/// Reply frame for one fetch: header line, then the body when it succeeded
fn answer(id: u64, url: &str, network: &dyn NetworkAccess) -> Vec<u8> {
    match network.fetch(url) {
        Ok(body) => {
            debug!(id, url, bytes = body.len(), "Served engine request");
            let mut frame = header_line(&FetchReply {
                id,
                ok: true,
                length: Some(body.len()),
                error: None,
            });
            frame.extend_from_slice(&body);
            frame
        }
        Err(e) => {
            warn!(id, url, error = %e, "Engine request failed");
            let message = e.to_string();
            header_line(&FetchReply {
                id,
                ok: false,
                length: None,
                error: Some(&message),
            })
        }
    }
}

fn header_line(reply: &FetchReply<'_>) -> Vec<u8> {
    let mut line = serde_json::to_vec(reply).unwrap_or_default();
    line.push(b'\n');
    line
}

async fn write_frame(stdin: &mut ChildStdin, frame: &[u8]) -> std::io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.flush().await
}

/// Owns the child: forwards stdout lines to the host, writes the host's
/// replies to stdin, reports the exit. Kills the child on `stop`.
async fn pump_child(
    command: EngineCommand,
    args: Vec<String>,
    events: std_mpsc::Sender<ChildEvent>,
    mut replies: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) {
    let spawned = Command::new(&command.program)
        .args(&args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let _ = events.send(ChildEvent::Failed(EngineError::Launch(format!(
                "Failed to start {}: {}",
                command.program, e
            ))));
            return;
        }
    };

    let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = events.send(ChildEvent::Failed(EngineError::Launch(
            "engine pipes unavailable".to_string(),
        )));
        return;
    };
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            reply = replies.recv() => match reply {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut stdin, &frame).await {
                        debug!(error = %e, "Engine closed its input");
                    }
                }
                // Host finished
                None => {
                    let _ = child.kill().await;
                    return;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if events.send(ChildEvent::Line(line)).is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Engine output unreadable");
                    break;
                }
            },
        }
    }

    drop(stdin);
    let status = tokio::select! {
        _ = stop.cancelled() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };
    let stderr = stderr_task.await.unwrap_or_default();
    let _ = events.send(match status {
        Ok(status) => ChildEvent::Exited {
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        },
        Err(e) => ChildEvent::Failed(EngineError::Launch(format!(
            "Failed to wait for engine: {}",
            e
        ))),
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves `body` for every URL and records the requests
    struct RecordingNetwork {
        body: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingNetwork {
        fn serving(body: &'static str) -> Self {
            Self {
                body: Some(body),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                body: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl NetworkAccess for RecordingNetwork {
        fn fetch(&self, url: &str) -> Result<Bytes, EngineError> {
            self.seen.lock().unwrap().push(url.to_string());
            match self.body {
                Some(body) => Ok(Bytes::from_static(body.as_bytes())),
                None => Err(EngineError::Network("all strategies failed".to_string())),
            }
        }
    }

    /// Requests the page URL, then reports the body it got back as the title
    const FETCHING_ENGINE: &str = r#"
printf '{"type":"fetch","id":1,"url":"%s"}\n' "$2"
IFS= read -r header
case "$header" in
  *'"ok":false'*)
    printf '{"type":"error","message":"ERROR: Unable to download webpage"}\n'
    exit 0 ;;
esac
len=$(printf '%s' "$header" | sed -n 's/.*"length":\([0-9]*\).*/\1/p')
body=$(head -c "$len")
printf '{"type":"result","info":{"title":"%s","duration":125}}\n' "$body"
"#;

    fn stand_in(script: &str) -> EngineCommand {
        EngineCommand::new("sh", ["-c", script, "engine"])
    }

    async fn relay(
        command: EngineCommand,
        network: RecordingNetwork,
        timeout: Duration,
    ) -> (Result<Value, EngineError>, Vec<String>) {
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            let result = run_relay(
                &runtime,
                &command,
                &json!({"quiet": true}),
                "https://video.example/watch?id=42",
                &network,
                timeout,
            );
            let seen = network.seen.lock().unwrap().clone();
            (result, seen)
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_requests_go_through_network_access() {
        let (result, seen) = relay(
            stand_in(FETCHING_ENGINE),
            RecordingNetwork::serving("Demo"),
            Duration::from_secs(10),
        )
        .await;

        let info = result.unwrap();
        assert_eq!(info["title"], "Demo");
        assert_eq!(info["duration"], 125);
        assert_eq!(seen, vec!["https://video.example/watch?id=42".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_fetch_is_reported_to_engine() {
        let (result, seen) = relay(
            stand_in(FETCHING_ENGINE),
            RecordingNetwork::failing(),
            Duration::from_secs(10),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(&err, EngineError::Reported(m) if m.contains("Unable to download webpage")));
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exit_without_result_reports_stderr() {
        let (result, seen) = relay(
            stand_in("echo 'ERROR: Unsupported URL' >&2; exit 1"),
            RecordingNetwork::serving("unused"),
            Duration::from_secs(10),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(&err, EngineError::Reported(m) if m == "ERROR: Unsupported URL"));
        assert!(seen.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_engine_times_out() {
        let started = Instant::now();
        let (result, _seen) = relay(
            stand_in("sleep 30"),
            RecordingNetwork::serving("unused"),
            Duration::from_millis(300),
        )
        .await;

        assert!(matches!(result, Err(EngineError::Reported(m)) if m.starts_with("Timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_program_fails_to_launch() {
        let (result, _seen) = relay(
            EngineCommand::new("/nonexistent/engine", Vec::<String>::new()),
            RecordingNetwork::serving("unused"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Launch(_))));
    }
}
