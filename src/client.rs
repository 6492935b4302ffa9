// Client-side access to a runner's control socket.
//
// Clients are short-lived blocking processes, so this speaks the sync side
// of the HTTP codec over std UnixStream with read/write timeouts. The one
// transport error treated as success is a reset while reading the stop
// response: the runner exits right after flushing it.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;

use crate::http::{self, percent_encode};
use crate::protocol::{
    ErrorBody, ObserveResponse, RestartRequest, RestartResponse, RunnerStatus, StopRequest,
    StopResponse,
};

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a freshly launched runner's socket to appear.
const LAUNCH_WAIT: Duration = Duration::from_millis(100);
const LAUNCH_ATTEMPTS: usize = 20;

/// Query parameters for `GET /v1/logs`, assembled client-side.
#[derive(Debug, Clone, Default)]
pub struct LogsQuery {
    pub since_cursor: Option<u64>,
    pub since_ms: Option<u64>,
    pub last: Option<usize>,
    pub stream: Option<String>,
    pub grep: Option<String>,
    pub regex: bool,
    pub case_sensitive: bool,
    pub invert: bool,
    pub max_lines: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl LogsQuery {
    pub fn to_query_string(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        if let Some(v) = self.since_cursor {
            pairs.push(format!("since_cursor={v}"));
        }
        if let Some(v) = self.since_ms {
            pairs.push(format!("since_ms={v}"));
        }
        if let Some(v) = self.last {
            pairs.push(format!("last={v}"));
        }
        if let Some(v) = &self.stream {
            pairs.push(format!("stream={}", percent_encode(v)));
        }
        if let Some(v) = &self.grep {
            pairs.push(format!("grep={}", percent_encode(v)));
        }
        if self.regex {
            pairs.push("regex=1".into());
        }
        if self.case_sensitive {
            pairs.push("case_sensitive=1".into());
        }
        if self.invert {
            pairs.push("invert=1".into());
        }
        if let Some(v) = self.max_lines {
            pairs.push(format!("max_lines={v}"));
        }
        if let Some(v) = self.max_bytes {
            pairs.push(format!("max_bytes={v}"));
        }
        pairs.join("&")
    }
}

/// A handle on one runner's socket.
pub struct RunnerClient {
    pub name: String,
    pub socket_path: PathBuf,
}

impl RunnerClient {
    pub fn new(name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket_path: socket_path.into(),
        }
    }

    pub fn status(&self) -> Result<RunnerStatus> {
        let (status, body) = self.exchange("GET", "/v1/status", None)?;
        self.decode(status, &body)
    }

    pub fn logs(&self, query: &LogsQuery) -> Result<ObserveResponse> {
        let qs = query.to_query_string();
        let target = if qs.is_empty() {
            "/v1/logs".to_string()
        } else {
            format!("/v1/logs?{qs}")
        };
        let (status, body) = self.exchange("GET", &target, None)?;
        self.decode(status, &body)
    }

    pub fn restart(&self, request: &RestartRequest) -> Result<RestartResponse> {
        let body = serde_json::to_vec(request).context("failed to encode restart request")?;
        let (status, body) = self.exchange("POST", "/v1/restart", Some(&body))?;
        self.decode(status, &body)
    }

    pub fn stop(&self, grace_ms: Option<u64>) -> Result<StopResponse> {
        let body =
            serde_json::to_vec(&StopRequest { grace_ms }).context("failed to encode stop request")?;
        match self.exchange("POST", "/v1/stop", Some(&body)) {
            Ok((status, body)) => self.decode(status, &body),
            Err(e) if is_benign_reset(&e) => Ok(StopResponse { stopped: true }),
            Err(e) => Err(e),
        }
    }

    fn exchange(&self, method: &str, target: &str, body: Option<&[u8]>) -> Result<(u16, Vec<u8>)> {
        if !self.socket_path.exists() {
            bail!(
                "no_runner: no runner for '{}' (expected socket at {})",
                self.name,
                self.socket_path.display()
            );
        }
        let stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "no_runner: failed to connect to {}",
                self.socket_path.display()
            )
        })?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("failed to set read timeout")?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("failed to set write timeout")?;
        http::request_sync(stream, method, target, body).map_err(|e| {
            if is_timeout(&e) {
                e.context(format!(
                    "request_timeout: runner '{}' did not respond within {:?}",
                    self.name, READ_TIMEOUT
                ))
            } else {
                e
            }
        })
    }

    fn decode<T: DeserializeOwned>(&self, status: u16, body: &[u8]) -> Result<T> {
        if status == 200 {
            return serde_json::from_slice(body)
                .with_context(|| format!("malformed response from runner '{}'", self.name));
        }
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(err) => bail!("{}: {}", err.error, err.message),
            Err(_) => bail!("runner '{}' returned HTTP {status}", self.name),
        }
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        })
}

fn is_benign_reset(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        })
}

/// Spawn a detached runner process and wait for its socket to answer.
/// `runner_args` is everything after the binary name.
pub fn launch_runner(runner_args: &[String], socket_path: &Path) -> Result<()> {
    let binary = runner_binary_path();
    Command::new(&binary)
        .args(runner_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to start runner at {}", binary.display()))?;

    for _ in 0..LAUNCH_ATTEMPTS {
        std::thread::sleep(LAUNCH_WAIT);
        if socket_path.exists() && UnixStream::connect(socket_path).is_ok() {
            return Ok(());
        }
    }
    bail!(
        "runner did not start within {:?} (socket not found at {})",
        LAUNCH_WAIT * LAUNCH_ATTEMPTS as u32,
        socket_path.display()
    )
}

/// Locate the tap-runner binary: next to the current executable first
/// (the normal install layout), then whatever PATH resolves.
fn runner_binary_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("tap-runner");
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("tap-runner")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_query_string_encodes_fields() {
        let query = LogsQuery {
            since_cursor: Some(7),
            grep: Some("hello world".into()),
            regex: true,
            invert: true,
            max_lines: Some(10),
            ..Default::default()
        };
        let qs = query.to_query_string();
        assert_eq!(
            qs,
            "since_cursor=7&grep=hello%20world&regex=1&invert=1&max_lines=10"
        );
    }

    #[test]
    fn empty_logs_query_is_empty() {
        assert_eq!(LogsQuery::default().to_query_string(), "");
    }

    #[test]
    fn missing_socket_maps_to_no_runner() {
        let client = RunnerClient::new("ghost", "/nonexistent/tap/ghost.sock");
        let err = client.status().unwrap_err();
        assert!(err.to_string().contains("no_runner"));
    }

    #[test]
    fn benign_reset_detection() {
        let reset = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_benign_reset(&reset));

        let refused = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!is_benign_reset(&refused));
    }
}
