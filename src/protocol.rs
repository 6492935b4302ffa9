// Wire protocol for the control API - shared structs for runner <-> client
// communication. JSON bodies over HTTP/1.1 on a Unix socket; timestamps are
// integer milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};

use crate::ring::{BufferStats, LogEvent};

/// Default grace period before a stop escalates to SIGKILL.
pub const DEFAULT_GRACE_MS: u64 = 2000;
/// Default ceiling on a restart readiness wait.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 20_000;

/// Lifecycle of the supervised process as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcState {
    Starting,
    Running,
    Stopped,
    Exited,
    Unknown,
}

impl std::fmt::Display for ProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcState::Starting => write!(f, "starting"),
            ProcState::Running => write!(f, "running"),
            ProcState::Stopped => write!(f, "stopped"),
            ProcState::Exited => write!(f, "exited"),
            ProcState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Machine-readable error codes carried in error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoRunner,
    RunnerExists,
    RequestTimeout,
    NotFound,
    BadRequest,
    BodyTooLarge,
    InvalidName,
    InvalidPattern,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorCode::NoRunner => "no_runner",
            ErrorCode::RunnerExists => "runner_exists",
            ErrorCode::RequestTimeout => "request_timeout",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::BodyTooLarge => "body_too_large",
            ErrorCode::InvalidName => "invalid_name",
            ErrorCode::InvalidPattern => "invalid_pattern",
            ErrorCode::InternalError => "internal_error",
        };
        write!(f, "{code}")
    }
}

/// Error response body: `{"error": <snake_case_code>, "message": <human>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

/// Exit fields from the most recent child termination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// `GET /v1/status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub name: String,
    pub runner_pid: u32,
    pub child_pid: Option<u32>,
    pub child_state: ProcState,
    pub started_at: u64,
    pub uptime_ms: u64,
    pub pty: bool,
    pub forward: bool,
    pub buffer: BufferStats,
    pub last_exit: LastExit,
}

/// `GET /v1/logs` response. `match_count` is the post-limit event count of
/// this response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveResponse {
    pub name: String,
    pub cursor_next: u64,
    pub truncated: bool,
    pub dropped: bool,
    pub events: Vec<LogEvent>,
    pub match_count: usize,
}

/// Readiness pattern kind for `POST /v1/restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyKind {
    Substring,
    Regex,
}

/// Readiness condition: scan post-restart events for a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySpec {
    #[serde(rename = "type")]
    pub kind: ReadyKind,
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// `POST /v1/restart` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub clear_logs: bool,
}

/// `POST /v1/restart` response. A readiness timeout is a successful
/// restart with `ready: false` and `reason: "timeout"`, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartResponse {
    pub restarted: bool,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub cursor_next: u64,
}

/// `POST /v1/stop` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
}

/// `POST /v1/stop` response. The runner exits right after flushing this,
/// so clients must tolerate a reset while reading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}
