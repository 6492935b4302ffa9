// Control server: HTTP/1.1 request/response over the runner's Unix socket.
//
// One task per connection, one exchange per connection. The stop endpoint
// finishes the child teardown before its response is written; the process
// shutdown is triggered only after that response has been flushed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::http::{self, Request, RequestError};
use crate::protocol::{
    ErrorBody, ErrorCode, LastExit, ObserveResponse, ReadyKind, RestartRequest, RestartResponse,
    RunnerStatus, StopRequest, StopResponse, DEFAULT_GRACE_MS, DEFAULT_READY_TIMEOUT_MS,
};
use crate::ring::{self, QueryOptions, SharedRing, Stream, DEFAULT_QUERY_LINES};
use crate::supervisor::Supervisor;
use crate::validate::Matcher;

/// Marker inserted before the old child is stopped.
pub const RESTART_REQUESTED_MARKER: &str = "--- restart requested ---";

/// Marker inserted after the new child exists but before its first output.
pub fn restarted_marker(pid: u32) -> String {
    format!("--- restarted (pid={pid}) ---")
}

/// How long the stale-socket probe waits for a status response.
const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything a request handler can reach. The server owns the supervisor
/// and the ring; handlers borrow them through this shared state.
pub struct RunnerState {
    pub name: String,
    pub started_at: u64,
    pub pty: bool,
    pub forward: bool,
    pub ring: SharedRing,
    pub supervisor: Supervisor,
    pub shutdown: CancellationToken,
}

/// What a handler decided to send back.
pub enum Reply {
    Json { status: u16, body: Vec<u8> },
    /// Stop response: flush it, then take the whole runner down.
    StopAndShutdown { body: Vec<u8> },
}

/// Bind the control socket, recovering from a stale file left behind by a
/// crashed runner. A path with a live responder is a hard error.
pub fn bind_socket(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        if probe_is_live(socket_path) {
            bail!(
                "runner_exists: a runner is already serving {} (inspect it with `tap status` or stop it with `tap stop`)",
                socket_path.display()
            );
        }
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        eprintln!("tap-runner: removed stale socket {}", socket_path.display());
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind socket {}", socket_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!("failed to set permissions on {}", socket_path.display())
            })?;
    }
    Ok(listener)
}

/// True when something on the other end of `path` answers a status probe
/// within the probe timeout. Runs blocking; only called before the accept
/// loop starts.
fn probe_is_live(path: &Path) -> bool {
    let Ok(stream) = std::os::unix::net::UnixStream::connect(path) else {
        return false;
    };
    let _ = stream.set_read_timeout(Some(STALE_PROBE_TIMEOUT));
    let _ = stream.set_write_timeout(Some(STALE_PROBE_TIMEOUT));
    http::request_sync(stream, "GET", "/v1/status", None).is_ok()
}

/// Accept connections until the shutdown token fires.
pub async fn serve(state: Arc<RunnerState>, listener: UnixListener) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, stream).await {
                                eprintln!("tap-runner: client error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("tap-runner: accept error: {e}");
                    }
                }
            }
        }
    }
}

async fn handle_connection(state: Arc<RunnerState>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let reply = match http::read_request(&mut reader).await {
        Ok(request) => match handle_request(&state, &request).await {
            Ok(reply) => reply,
            Err(e) => error_reply(500, ErrorCode::InternalError, format!("{e:#}")),
        },
        Err(RequestError::Closed) => return Ok(()),
        Err(err @ RequestError::TooLarge { .. }) => {
            error_reply(413, ErrorCode::BodyTooLarge, err.to_string())
        }
        Err(err) => error_reply(400, ErrorCode::BadRequest, err.to_string()),
    };

    match reply {
        Reply::Json { status, body } => {
            http::write_json_response(&mut write_half, status, &body).await?;
        }
        Reply::StopAndShutdown { body } => {
            http::write_json_response(&mut write_half, 200, &body).await?;
            // The response is on the wire; now take the runner down.
            state.shutdown.cancel();
        }
    }
    Ok(())
}

/// Route one parsed request. Public so tests can drive handlers without a
/// socket.
pub async fn handle_request(state: &Arc<RunnerState>, request: &Request) -> Result<Reply> {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/v1/status") => json_reply(200, &status_view(state)),
        ("GET", "/v1/logs") => handle_logs(state, request),
        ("POST", "/v1/restart") => handle_restart(state, request).await,
        ("POST", "/v1/stop") => handle_stop(state, request).await,
        (method, path) => Ok(error_reply(
            404,
            ErrorCode::NotFound,
            format!("no such endpoint: {method} {path}"),
        )),
    }
}

fn status_view(state: &Arc<RunnerState>) -> RunnerStatus {
    let child = state.supervisor.state();
    let buffer = state.ring.lock().unwrap().stats();
    RunnerStatus {
        name: state.name.clone(),
        runner_pid: std::process::id(),
        child_pid: child.pid,
        child_state: child.state,
        started_at: state.started_at,
        uptime_ms: ring::now_ms().saturating_sub(state.started_at),
        pty: state.pty,
        forward: state.forward,
        buffer,
        last_exit: LastExit {
            code: child.exit_code,
            signal: child.exit_signal,
        },
    }
}

fn handle_logs(state: &Arc<RunnerState>, request: &Request) -> Result<Reply> {
    let opts = match query_options(request) {
        Ok(opts) => opts,
        Err(reply) => return Ok(reply),
    };
    let result = state.ring.lock().unwrap().query(&opts);
    let response = ObserveResponse {
        name: state.name.clone(),
        cursor_next: result.cursor_next,
        truncated: result.truncated,
        dropped: result.dropped,
        match_count: result.events.len(),
        events: result.events,
    };
    json_reply(200, &response)
}

/// Build `QueryOptions` from the query string. Boolean flags use `"1"`;
/// `last=80` applies only when no window selector was given.
fn query_options(request: &Request) -> std::result::Result<QueryOptions, Reply> {
    let since_cursor = query_number::<u64>(request, "since_cursor")?;
    let since_ms = query_number::<u64>(request, "since_ms")?;
    let mut last = query_number::<usize>(request, "last")?;
    if since_cursor.is_none() && since_ms.is_none() && last.is_none() {
        last = Some(DEFAULT_QUERY_LINES);
    }

    let stream = match request.query_get("stream") {
        Some(raw) => Some(raw.parse::<Stream>().map_err(|e| {
            error_reply(400, ErrorCode::BadRequest, e)
        })?),
        None => None,
    };

    let grep = match request.query_get("grep") {
        Some(pattern) => Some(
            Matcher::compile(
                pattern,
                request.query_flag("regex"),
                request.query_flag("case_sensitive"),
            )
            .map_err(|e| error_reply(400, ErrorCode::InvalidPattern, format!("{e:#}")))?,
        ),
        None => None,
    };

    Ok(QueryOptions {
        since_cursor,
        since_ms,
        last,
        stream,
        grep,
        invert: request.query_flag("invert"),
        max_lines: query_number::<usize>(request, "max_lines")?,
        max_bytes: query_number::<usize>(request, "max_bytes")?,
    })
}

fn query_number<T: std::str::FromStr>(
    request: &Request,
    key: &str,
) -> std::result::Result<Option<T>, Reply> {
    match request.query_get(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            error_reply(
                400,
                ErrorCode::BadRequest,
                format!("invalid value for '{key}': {raw}"),
            )
        }),
        None => Ok(None),
    }
}

async fn handle_restart(state: &Arc<RunnerState>, request: &Request) -> Result<Reply> {
    let body: RestartRequest = match parse_body(&request.body) {
        Ok(body) => body,
        Err(message) => return Ok(error_reply(400, ErrorCode::BadRequest, message)),
    };

    // Validate the readiness pattern before touching the child.
    let matcher = match &body.ready {
        Some(ready) => match Matcher::compile(
            &ready.pattern,
            ready.kind == ReadyKind::Regex,
            ready.case_sensitive,
        ) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                return Ok(error_reply(
                    400,
                    ErrorCode::InvalidPattern,
                    format!("{e:#}"),
                ))
            }
        },
        None => None,
    };
    let grace_ms = body.grace_ms.unwrap_or(DEFAULT_GRACE_MS);
    let timeout_ms = body.timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS);

    // Floor for readiness scanning, captured before the marker goes in.
    let restart_cursor = {
        let mut ring = state.ring.lock().unwrap();
        let cursor = ring.next_seq();
        ring.insert_marker(RESTART_REQUESTED_MARKER);
        cursor
    };

    state
        .supervisor
        .stop(grace_ms)
        .await
        .context("failed to stop child for restart")?;

    if body.clear_logs {
        state.ring.lock().unwrap().clear();
    }

    let spawned = match state.supervisor.spawn().await {
        Ok(spawned) => spawned,
        Err(e) => {
            return Ok(error_reply(
                500,
                ErrorCode::InternalError,
                format!("failed to respawn child: {e:#}"),
            ))
        }
    };
    let pid = spawned.pid;
    state.ring.lock().unwrap().insert_marker(restarted_marker(pid));
    state.supervisor.supervise(spawned).await;

    let mut response = RestartResponse {
        restarted: true,
        ready: true,
        ready_match: None,
        reason: None,
        snippet: None,
        pid: Some(pid),
        cursor_next: state.ring.lock().unwrap().next_seq(),
    };

    if let Some(matcher) = matcher {
        let outcome = ring::wait_for_match(
            &state.ring,
            &matcher,
            restart_cursor,
            timeout_ms,
            &state.shutdown,
        )
        .await;
        response.cursor_next = state.ring.lock().unwrap().next_seq();
        if outcome.matched {
            response.ready_match = outcome.match_text;
        } else {
            // Readiness failure is a domain outcome, not an error; the new
            // child keeps running.
            response.ready = false;
            response.reason = Some("timeout".to_string());
            response.snippet = Some(outcome.snippet);
        }
    }

    json_reply(200, &response)
}

async fn handle_stop(state: &Arc<RunnerState>, request: &Request) -> Result<Reply> {
    let body: StopRequest = match parse_body(&request.body) {
        Ok(body) => body,
        Err(message) => return Ok(error_reply(400, ErrorCode::BadRequest, message)),
    };
    let grace_ms = body.grace_ms.unwrap_or(DEFAULT_GRACE_MS);
    state
        .supervisor
        .stop(grace_ms)
        .await
        .context("failed to stop child")?;
    Ok(Reply::StopAndShutdown {
        body: serde_json::to_vec(&StopResponse { stopped: true })?,
    })
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> std::result::Result<T, String> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))
}

fn json_reply<T: Serialize>(status: u16, value: &T) -> Result<Reply> {
    Ok(Reply::Json {
        status,
        body: serde_json::to_vec(value)?,
    })
}

fn error_reply(status: u16, code: ErrorCode, message: impl Into<String>) -> Reply {
    let body = serde_json::to_vec(&ErrorBody::new(code, message))
        .unwrap_or_else(|_| br#"{"error":"internal_error","message":"encoding failed"}"#.to_vec());
    Reply::Json { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::now_ms;
    use crate::supervisor::ChildSpec;
    use crate::test_utils::{assert_eventually, assert_eventually_bool};
    use tempfile::TempDir;

    fn make_state(script: &str) -> Arc<RunnerState> {
        let ring = ring::shared(1000, 1_000_000);
        let spec = ChildSpec {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            cwd: None,
            env: Vec::new(),
            use_pty: false,
        };
        Arc::new(RunnerState {
            name: "svc".into(),
            started_at: now_ms(),
            pty: false,
            forward: false,
            supervisor: Supervisor::new(spec, Arc::clone(&ring), false),
            ring,
            shutdown: CancellationToken::new(),
        })
    }

    fn get(path: &str, query: &str) -> Request {
        Request {
            method: "GET".into(),
            path: path.into(),
            query: http::parse_query(query),
            body: Vec::new(),
        }
    }

    fn post(path: &str, body: &str) -> Request {
        Request {
            method: "POST".into(),
            path: path.into(),
            query: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn decode<T: DeserializeOwned>(reply: &Reply) -> (u16, T) {
        match reply {
            Reply::Json { status, body } => (*status, serde_json::from_slice(body).unwrap()),
            Reply::StopAndShutdown { body } => (200, serde_json::from_slice(body).unwrap()),
        }
    }

    async fn wait_for_lines(state: &Arc<RunnerState>, count: usize) {
        let state = Arc::clone(state);
        assert_eventually(
            "captured line count",
            std::time::Duration::from_secs(5),
            std::time::Duration::from_millis(25),
            move || {
                let state = Arc::clone(&state);
                async move {
                    let lines = state.ring.lock().unwrap().stats().current_lines;
                    if lines >= count {
                        Ok(())
                    } else {
                        Err(format!("only {lines} lines captured"))
                    }
                }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn status_reflects_live_state() {
        let state = make_state("echo hi; sleep 30");
        let pid = state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 1).await;

        let reply = handle_request(&state, &get("/v1/status", "")).await.unwrap();
        let (status, body): (u16, RunnerStatus) = decode(&reply);
        assert_eq!(status, 200);
        assert_eq!(body.name, "svc");
        assert_eq!(body.runner_pid, std::process::id());
        assert_eq!(body.child_pid, Some(pid));
        assert_eq!(body.child_state, crate::protocol::ProcState::Running);
        assert_eq!(body.buffer.current_lines, 1);
        assert!(!body.pty);

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn logs_returns_captured_lines_with_cursor() {
        let state = make_state("echo 'line 1'; echo 'line 2'; sleep 30");
        state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 2).await;

        let reply = handle_request(&state, &get("/v1/logs", "last=10"))
            .await
            .unwrap();
        let (status, body): (u16, ObserveResponse) = decode(&reply);
        assert_eq!(status, 200);
        assert_eq!(body.events.len(), 2);
        assert_eq!(body.events[0].seq, 1);
        assert_eq!(body.events[0].text, "line 1");
        assert_eq!(body.events[1].seq, 2);
        assert_eq!(body.events[1].text, "line 2");
        assert_eq!(body.cursor_next, 3);
        assert_eq!(body.match_count, 2);
        assert!(!body.truncated);
        assert!(!body.dropped);

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn logs_applies_grep_and_stream_filters() {
        let state = make_state("echo keep; echo drop >&2; sleep 30");
        state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 2).await;

        let reply = handle_request(&state, &get("/v1/logs", "stream=stdout"))
            .await
            .unwrap();
        let (_, body): (u16, ObserveResponse) = decode(&reply);
        assert_eq!(body.events.len(), 1);
        assert_eq!(body.events[0].text, "keep");

        let reply = handle_request(&state, &get("/v1/logs", "grep=keep&invert=1"))
            .await
            .unwrap();
        let (_, body): (u16, ObserveResponse) = decode(&reply);
        assert_eq!(body.events.len(), 1);
        assert_eq!(body.events[0].text, "drop");

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn logs_rejects_dangerous_patterns() {
        let state = make_state("sleep 30");
        state.supervisor.start().await.unwrap();

        let reply = handle_request(&state, &get("/v1/logs", "grep=.*.*&regex=1"))
            .await
            .unwrap();
        let (status, body): (u16, ErrorBody) = decode(&reply);
        assert_eq!(status, 400);
        assert_eq!(body.error, ErrorCode::InvalidPattern);

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = make_state("sleep 30");
        let reply = handle_request(&state, &get("/v1/nope", "")).await.unwrap();
        let (status, body): (u16, ErrorBody) = decode(&reply);
        assert_eq!(status, 404);
        assert_eq!(body.error, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let state = make_state("sleep 30");
        let reply = handle_request(&state, &post("/v1/restart", "{not json"))
            .await
            .unwrap();
        let (status, body): (u16, ErrorBody) = decode(&reply);
        assert_eq!(status, 400);
        assert_eq!(body.error, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn restart_without_ready_returns_immediately() {
        let state = make_state("echo old; sleep 30");
        state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 1).await;

        let reply = handle_request(&state, &post("/v1/restart", r#"{"grace_ms":500}"#))
            .await
            .unwrap();
        let (status, body): (u16, RestartResponse) = decode(&reply);
        assert_eq!(status, 200);
        assert!(body.restarted);
        assert!(body.ready);
        assert!(body.ready_match.is_none());
        assert!(body.pid.is_some());

        // Both markers are in the ring, in order.
        let events = state
            .ring
            .lock()
            .unwrap()
            .query(&QueryOptions::default())
            .events;
        let markers: Vec<_> = events
            .iter()
            .filter(|e| e.text.starts_with("---"))
            .collect();
        assert_eq!(markers[0].text, RESTART_REQUESTED_MARKER);
        assert!(markers[1].text.starts_with("--- restarted (pid="));
        // The immediate-return cursor skips both markers.
        assert!(body.cursor_next > markers[1].seq);

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn restart_with_readiness_pattern() {
        let state = make_state("echo booting; sleep 0.1; echo RESTARTED_READY; sleep 30");
        state.supervisor.start().await.unwrap();

        let before = state.ring.lock().unwrap().next_seq();
        let reply = handle_request(
            &state,
            &post(
                "/v1/restart",
                r#"{"grace_ms":500,"timeout_ms":5000,"ready":{"type":"substring","pattern":"RESTARTED_READY"}}"#,
            ),
        )
        .await
        .unwrap();
        let (status, body): (u16, RestartResponse) = decode(&reply);
        assert_eq!(status, 200);
        assert!(body.ready);
        assert!(body
            .ready_match
            .as_deref()
            .unwrap()
            .contains("RESTARTED_READY"));
        assert!(body.cursor_next > before);

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn restart_readiness_timeout_is_not_an_error() {
        let state = make_state("echo waiting; sleep 30");
        state.supervisor.start().await.unwrap();

        let reply = handle_request(
            &state,
            &post(
                "/v1/restart",
                r#"{"grace_ms":300,"timeout_ms":400,"ready":{"type":"substring","pattern":"NEVER_PRINTED"}}"#,
            ),
        )
        .await
        .unwrap();
        let (status, body): (u16, RestartResponse) = decode(&reply);
        assert_eq!(status, 200);
        assert!(body.restarted);
        assert!(!body.ready);
        assert_eq!(body.reason.as_deref(), Some("timeout"));
        assert!(body.snippet.is_some());
        // The child keeps running after a readiness timeout.
        assert_eq!(
            state.supervisor.state().state,
            crate::protocol::ProcState::Running
        );

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn restart_with_clear_logs_drops_old_events() {
        let state = make_state("echo old; sleep 30");
        state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 1).await;

        let reply = handle_request(
            &state,
            &post("/v1/restart", r#"{"grace_ms":500,"clear_logs":true}"#),
        )
        .await
        .unwrap();
        let (_, body): (u16, RestartResponse) = decode(&reply);
        assert!(body.restarted);

        let events = state
            .ring
            .lock()
            .unwrap()
            .query(&QueryOptions::default())
            .events;
        assert!(events[0].text.starts_with("--- restarted (pid="));
        // Sequence numbers keep climbing across the clear, and nothing
        // from before the restart marker survives it.
        assert!(events[0].seq > 1);
        assert!(events.iter().all(|e| e.seq >= events[0].seq));

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn restart_rejects_invalid_ready_pattern() {
        let state = make_state("sleep 30");
        state.supervisor.start().await.unwrap();

        let reply = handle_request(
            &state,
            &post(
                "/v1/restart",
                r#"{"ready":{"type":"regex","pattern":"(a|b)+"}}"#,
            ),
        )
        .await
        .unwrap();
        let (status, body): (u16, ErrorBody) = decode(&reply);
        assert_eq!(status, 400);
        assert_eq!(body.error, ErrorCode::InvalidPattern);
        // The child was not touched.
        assert_eq!(
            state.supervisor.state().state,
            crate::protocol::ProcState::Running
        );

        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn stop_endpoint_tears_down_then_requests_shutdown() {
        let state = make_state("sleep 30");
        state.supervisor.start().await.unwrap();

        let reply = handle_request(&state, &post("/v1/stop", r#"{"grace_ms":500}"#))
            .await
            .unwrap();
        match &reply {
            Reply::StopAndShutdown { body } => {
                let parsed: StopResponse = serde_json::from_slice(body).unwrap();
                assert!(parsed.stopped);
            }
            Reply::Json { .. } => panic!("expected StopAndShutdown"),
        }
        // Teardown completed before the reply was produced.
        assert_eq!(
            state.supervisor.state().state,
            crate::protocol::ProcState::Stopped
        );
    }

    #[tokio::test]
    async fn stale_socket_is_recovered_at_bind() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("svc.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let listener = bind_socket(&socket_path).unwrap();
        drop(listener);
        assert!(socket_path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_refuses_live_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("svc.sock");

        let state = make_state("sleep 30");
        state.supervisor.start().await.unwrap();
        let listener = bind_socket(&socket_path).unwrap();
        let serving = Arc::clone(&state);
        tokio::spawn(async move {
            serve(serving, listener).await;
        });

        let path = socket_path.clone();
        let result = tokio::task::spawn_blocking(move || bind_socket(&path))
            .await
            .unwrap();
        let err = result.err().expect("bind must refuse a live socket");
        assert!(err.to_string().contains("runner_exists"));

        state.shutdown.cancel();
        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_level_roundtrip_over_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("svc.sock");

        let state = make_state("echo over-socket; sleep 30");
        state.supervisor.start().await.unwrap();
        wait_for_lines(&state, 1).await;

        let listener = bind_socket(&socket_path).unwrap();
        let serving = Arc::clone(&state);
        tokio::spawn(async move {
            serve(serving, listener).await;
        });

        let path = socket_path.clone();
        let (status, body) = tokio::task::spawn_blocking(move || {
            let stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
            http::request_sync(stream, "GET", "/v1/logs?last=5", None).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(status, 200);
        let parsed: ObserveResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].text, "over-socket");

        state.shutdown.cancel();
        state.supervisor.stop(500).await.unwrap();
    }

    #[tokio::test]
    async fn status_after_child_exit_reports_last_exit() {
        let state = make_state("exit 7");
        state.supervisor.start().await.unwrap();

        let waiting = Arc::clone(&state);
        assert_eventually_bool(
            "child exit observed",
            std::time::Duration::from_secs(5),
            std::time::Duration::from_millis(25),
            move || {
                let state = Arc::clone(&waiting);
                async move {
                    state.supervisor.state().state == crate::protocol::ProcState::Exited
                }
            },
        )
        .await;

        let reply = handle_request(&state, &get("/v1/status", "")).await.unwrap();
        let (_, body): (u16, RunnerStatus) = decode(&reply);
        assert_eq!(body.child_state, crate::protocol::ProcState::Exited);
        assert_eq!(body.last_exit.code, Some(7));
        assert!(body.child_pid.is_none());
    }
}
