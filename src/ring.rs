// In-memory, sequence-numbered log store for one runner.
//
// The supervisor appends line events; the control server queries them. A
// single mutex serializes every access. Eviction enforces both a line cap
// and a byte cap; sequence numbers are assigned once and never reused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::validate::Matcher;

/// Retention caps for a runner's buffer.
pub const DEFAULT_MAX_LINES: usize = 5000;
pub const DEFAULT_MAX_BYTES: usize = 10_000_000;

/// Per-query limits applied when the request leaves them out.
pub const DEFAULT_QUERY_LINES: usize = 80;
pub const DEFAULT_QUERY_BYTES: usize = 32 * 1024;

/// Interval between readiness-wait scans of the buffer.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Trailing lines retained in a readiness snippet.
const SNIPPET_LINES: usize = 10;

/// Which child stream a line came from. PTY capture produces only
/// `combined`; pipe capture labels `stdout` and `stderr` separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Combined,
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Combined => write!(f, "combined"),
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

impl std::str::FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(Stream::Combined),
            "stdout" => Ok(Stream::Stdout),
            "stderr" => Ok(Stream::Stderr),
            _ => Err(format!("unknown stream: {s}")),
        }
    }
}

/// One captured line. `text` carries no trailing newline or carriage
/// return; `ts` is wall-clock milliseconds at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub ts: u64,
    pub stream: Stream,
    pub text: String,
}

/// Window, filters, and limits for a log query. At most one of
/// `since_cursor` / `since_ms` / `last` should be set; with none set the
/// whole retained range is considered.
///
/// A `stream` filter of `combined` is a no-op (accepts every stream);
/// `stdout` / `stderr` select only lines with that exact label, so
/// `combined` events never satisfy them.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub since_cursor: Option<u64>,
    pub since_ms: Option<u64>,
    pub last: Option<usize>,
    pub stream: Option<Stream>,
    pub grep: Option<Matcher>,
    pub invert: bool,
    pub max_lines: Option<usize>,
    pub max_bytes: Option<usize>,
}

/// Result of a query. `cursor_next` is the cursor a reader should supply
/// next; repeated queries with it strictly advance and never replay an
/// event. `dropped` reports that the requested cursor fell below the
/// retention floor.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub events: Vec<LogEvent>,
    pub cursor_next: u64,
    pub truncated: bool,
    pub dropped: bool,
}

/// Buffer occupancy reported in the status endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferStats {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub current_lines: usize,
    pub current_bytes: usize,
}

/// Outcome of a readiness wait. `snippet` holds the last up-to-10 texts
/// among the events considered, whether or not a match was found.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched: bool,
    pub match_text: Option<String>,
    pub snippet: Vec<String>,
}

pub struct RingBuffer {
    events: VecDeque<LogEvent>,
    next_seq: u64,
    total_bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

pub type SharedRing = Arc<Mutex<RingBuffer>>;

/// Current wall-clock time in integer milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn shared(max_lines: usize, max_bytes: usize) -> SharedRing {
    Arc::new(Mutex::new(RingBuffer::new(max_lines, max_bytes)))
}

impl RingBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_seq: 1,
            total_bytes: 0,
            max_lines,
            max_bytes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    }

    /// The sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Smallest sequence still retained; equals `next_seq` when empty.
    pub fn lowest_seq(&self) -> u64 {
        self.events.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            max_lines: self.max_lines,
            max_bytes: self.max_bytes,
            current_lines: self.events.len(),
            current_bytes: self.total_bytes,
        }
    }

    /// Append one line and run eviction. Never fails.
    pub fn append(&mut self, text: impl Into<String>, stream: Stream) -> LogEvent {
        let event = LogEvent {
            seq: self.next_seq,
            ts: now_ms(),
            stream,
            text: text.into(),
        };
        self.next_seq += 1;
        self.total_bytes += event.text.len();
        self.events.push_back(event.clone());
        self.evict();
        event
    }

    /// Append a runner-injected marker line on the `combined` stream.
    /// Markers are ordinary events; consumers recognize them by text.
    pub fn insert_marker(&mut self, text: impl Into<String>) -> LogEvent {
        self.append(text, Stream::Combined)
    }

    /// Drop every retained event. The sequence counter is preserved, so
    /// cursors taken before the clear stay monotone.
    pub fn clear(&mut self) {
        self.events.clear();
        self.total_bytes = 0;
    }

    fn evict(&mut self) {
        while self.events.len() > self.max_lines || self.total_bytes > self.max_bytes {
            match self.events.pop_front() {
                Some(old) => self.total_bytes -= old.text.len(),
                None => break,
            }
        }
    }

    pub fn query(&self, opts: &QueryOptions) -> QueryResult {
        let mut dropped = false;

        let selected: Vec<&LogEvent> = if let Some(cursor) = opts.since_cursor {
            if cursor < self.lowest_seq() {
                dropped = true;
            }
            self.events.iter().filter(|e| e.seq >= cursor).collect()
        } else if let Some(window) = opts.since_ms {
            let floor = now_ms().saturating_sub(window);
            self.events.iter().filter(|e| e.ts >= floor).collect()
        } else if let Some(last) = opts.last {
            let skip = self.events.len().saturating_sub(last);
            self.events.iter().skip(skip).collect()
        } else {
            self.events.iter().collect()
        };

        let filtered: Vec<&LogEvent> = selected
            .into_iter()
            .filter(|e| match opts.stream {
                Some(Stream::Stdout) => e.stream == Stream::Stdout,
                Some(Stream::Stderr) => e.stream == Stream::Stderr,
                _ => true,
            })
            .filter(|e| match &opts.grep {
                Some(matcher) => matcher.is_match(&e.text) != opts.invert,
                None => true,
            })
            .collect();

        let max_lines = opts.max_lines.unwrap_or(DEFAULT_QUERY_LINES);
        let max_bytes = opts.max_bytes.unwrap_or(DEFAULT_QUERY_BYTES);

        let mut events: Vec<LogEvent> = Vec::new();
        let mut bytes = 0usize;
        let mut truncated = false;
        for event in filtered {
            let len = event.text.len();
            let would_exceed = events.len() + 1 > max_lines || bytes + len > max_bytes;
            // The first event is always included so an oversize line cannot
            // wedge a cursor in place.
            if would_exceed && !events.is_empty() {
                truncated = true;
                break;
            }
            bytes += len;
            events.push(event.clone());
        }

        let cursor_next = events.last().map(|e| e.seq + 1).unwrap_or(self.next_seq);
        QueryResult {
            events,
            cursor_next,
            truncated,
            dropped,
        }
    }

    fn scan_for_match(&self, matcher: &Matcher, after_cursor: u64) -> (Option<String>, Vec<String>) {
        let mut snippet: VecDeque<String> = VecDeque::with_capacity(SNIPPET_LINES);
        for event in self.events.iter().filter(|e| e.seq >= after_cursor) {
            if snippet.len() == SNIPPET_LINES {
                snippet.pop_front();
            }
            snippet.push_back(event.text.clone());
            if matcher.is_match(&event.text) {
                return (Some(event.text.clone()), snippet.into());
            }
        }
        (None, snippet.into())
    }
}

/// Poll the buffer until a line with `seq >= after_cursor` matches, the
/// deadline passes, or `cancel` fires. Cancellation resolves exactly like a
/// timeout so callers see one shape.
pub async fn wait_for_match(
    ring: &SharedRing,
    matcher: &Matcher,
    after_cursor: u64,
    timeout_ms: u64,
    cancel: &CancellationToken,
) -> MatchOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let (hit, snippet) = ring.lock().unwrap().scan_for_match(matcher, after_cursor);
        if let Some(text) = hit {
            return MatchOutcome {
                matched: true,
                match_text: Some(text),
                snippet,
            };
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return MatchOutcome {
                matched: false,
                match_text: None,
                snippet,
            };
        }
        let tick = POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = cancel.cancelled() => {
                return MatchOutcome {
                    matched: false,
                    match_text: None,
                    snippet,
                };
            }
        }
    }
}
