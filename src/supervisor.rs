// Child supervision: spawning, line-framed capture, and graceful-then-
// forceful termination of the one wrapped process.
//
// Both I/O backends (pipes, PTY) feed labelled byte chunks into a single
// channel; one pump task does the line framing and ring appends, so the
// framing rules are identical in either mode. Spawning is two-phase:
// `spawn` creates the process with nothing pumping yet, `supervise`
// attaches the pump and exit watcher. That gap is where the server
// sequences restart markers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use libc::pid_t;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::ProcState;
use crate::ring::{SharedRing, Stream};

/// Default PTY window size.
const PTY_COLS: u16 = 80;
const PTY_ROWS: u16 = 24;

const READ_CHUNK: usize = 4096;
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Wait after SIGKILL for the OS to reap the group.
const KILL_REAP_WAIT: Duration = Duration::from_millis(100);

/// What to run and how to capture it.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overrides layered on the inherited process environment.
    pub env: Vec<(String, String)>,
    pub use_pty: bool,
}

/// Value summary of the supervised process, readable at any time.
#[derive(Debug, Clone, Copy)]
pub struct ChildState {
    pub pid: Option<u32>,
    pub state: ProcState,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

impl Default for ChildState {
    fn default() -> Self {
        Self {
            pid: None,
            state: ProcState::Stopped,
            exit_code: None,
            exit_signal: None,
        }
    }
}

/// A spawned process whose output is not yet being delivered. Chunks
/// buffer in the channel until `supervise` attaches the pump, so anything
/// the caller appends to the ring in between is ordered strictly before
/// the child's first line.
pub struct Spawned {
    pub pid: u32,
    chunks: mpsc::Receiver<(Stream, Vec<u8>)>,
    wait: WaitKind,
}

enum WaitKind {
    Pipes(tokio::process::Child),
    Pty {
        child: Box<dyn portable_pty::Child + Send>,
        master: Box<dyn MasterPty + Send>,
    },
}

struct RunningChild {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
    pump: JoinHandle<()>,
    waiter: JoinHandle<()>,
}

pub struct Supervisor {
    spec: ChildSpec,
    ring: SharedRing,
    forward: bool,
    state: Arc<StdMutex<ChildState>>,
    running: Mutex<Option<RunningChild>>,
}

impl Supervisor {
    pub fn new(spec: ChildSpec, ring: SharedRing, forward: bool) -> Self {
        Self {
            spec,
            ring,
            forward,
            state: Arc::new(StdMutex::new(ChildState::default())),
            running: Mutex::new(None),
        }
    }

    /// Snapshot of the current child state.
    pub fn state(&self) -> ChildState {
        *self.state.lock().unwrap()
    }

    /// Spawn then immediately supervise. Used at runner startup where no
    /// marker needs sequencing.
    pub async fn start(&self) -> Result<u32> {
        let spawned = self.spawn().await?;
        let pid = spawned.pid;
        self.supervise(spawned).await;
        Ok(pid)
    }

    /// Spawn the child without pumping its output yet. Failure records an
    /// exited state with a synthetic exit code of 1.
    pub async fn spawn(&self) -> Result<Spawned> {
        {
            let mut st = self.state.lock().unwrap();
            st.state = ProcState::Starting;
            st.pid = None;
            st.exit_code = None;
            st.exit_signal = None;
        }
        let result = if self.spec.use_pty {
            self.spawn_pty()
        } else {
            self.spawn_pipes()
        };
        match result {
            Ok(spawned) => {
                let mut st = self.state.lock().unwrap();
                st.pid = Some(spawned.pid);
                st.state = ProcState::Running;
                Ok(spawned)
            }
            Err(err) => {
                let mut st = self.state.lock().unwrap();
                st.state = ProcState::Exited;
                st.exit_code = Some(1);
                Err(err)
            }
        }
    }

    fn spawn_pipes(&self) -> Result<Spawned> {
        let (program, args) = self
            .spec
            .command
            .split_first()
            .context("empty child command")?;
        let mut command = Command::new(program);
        command
            .args(args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{program}'"))?;
        let pid = child.id().context("spawned child has no pid")?;

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;
        let (tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(read_chunks(stdout, Stream::Stdout, tx.clone()));
        tokio::spawn(read_chunks(stderr, Stream::Stderr, tx));

        Ok(Spawned {
            pid,
            chunks,
            wait: WaitKind::Pipes(child),
        })
    }

    fn spawn_pty(&self) -> Result<Spawned> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;
        let portable_pty::PtyPair { master, slave } = pair;

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-lc");
        cmd.arg(shell_quote(&self.spec.command));
        if let Some(cwd) = &self.spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .context("failed to spawn pty child")?;
        let pid = child.process_id().context("pty child has no pid")?;
        drop(slave);

        let mut reader = master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let (tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        // Blocking bridge from the PTY into the async pump channel. Ends on
        // EOF/EIO once the child side closes.
        std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send((Stream::Combined, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Spawned {
            pid,
            chunks,
            wait: WaitKind::Pty { child, master },
        })
    }

    /// Attach the line pump and exit watcher to a spawned child.
    pub async fn supervise(&self, spawned: Spawned) {
        let Spawned { pid, chunks, wait } = spawned;
        let (exited_tx, exited_rx) = watch::channel(false);

        let pump = tokio::spawn(pump_lines(chunks, Arc::clone(&self.ring), self.forward));

        let state = Arc::clone(&self.state);
        let waiter = tokio::spawn(async move {
            let (code, signal) = match wait {
                WaitKind::Pipes(mut child) => match child.wait().await {
                    Ok(status) => {
                        use std::os::unix::process::ExitStatusExt;
                        (status.code(), status.signal())
                    }
                    Err(_) => (Some(1), None),
                },
                WaitKind::Pty { mut child, master } => {
                    let status = tokio::task::spawn_blocking(move || child.wait()).await;
                    drop(master);
                    match status {
                        Ok(Ok(status)) => (Some(status.exit_code() as i32), None),
                        _ => (Some(1), None),
                    }
                }
            };
            {
                let mut st = state.lock().unwrap();
                if matches!(st.state, ProcState::Running | ProcState::Starting) {
                    st.state = ProcState::Exited;
                }
                st.pid = None;
                st.exit_code = code;
                st.exit_signal = signal;
            }
            let _ = exited_tx.send(true);
        });

        let mut slot = self.running.lock().await;
        *slot = Some(RunningChild {
            pid,
            exited_rx,
            pump,
            waiter,
        });
    }

    /// Graceful-then-forceful stop. Signals the process group first, falls
    /// back to the pid, escalates to SIGKILL after `grace_ms`, and joins
    /// the I/O pump so every line from this child is in the ring before
    /// the caller appends anything else.
    pub async fn stop(&self, grace_ms: u64) -> Result<()> {
        let mut slot = self.running.lock().await;
        let Some(child) = slot.take() else {
            return Ok(());
        };

        let was_running = self.state().state == ProcState::Running;
        if was_running {
            let pid = child.pid as pid_t;
            match kill(-pid, libc::SIGTERM) {
                KillResult::Delivered | KillResult::NoSuchProcess => {}
                KillResult::Failed => {
                    let _ = kill(pid, libc::SIGTERM);
                }
            }

            let mut exited_rx = child.exited_rx.clone();
            let graceful = tokio::time::timeout(Duration::from_millis(grace_ms), async {
                while !*exited_rx.borrow() {
                    if exited_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;

            if graceful.is_err() && self.state().state == ProcState::Running {
                if matches!(kill(-pid, libc::SIGKILL), KillResult::Failed) {
                    let _ = kill(pid, libc::SIGKILL);
                }
                tokio::time::sleep(KILL_REAP_WAIT).await;
            }
        }

        let _ = child.waiter.await;
        let _ = child.pump.await;

        // A child that had already exited keeps its exited state; only an
        // actual teardown ends in `stopped`.
        if was_running {
            let mut st = self.state.lock().unwrap();
            st.state = ProcState::Stopped;
            st.pid = None;
        }
        Ok(())
    }
}

async fn read_chunks<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Read errors end the stream; the exit status governs state.
            Err(_) => break,
        }
    }
}

/// Frame labelled byte chunks into lines and append them to the ring.
/// Partial data accumulates per stream; whatever is left when the channel
/// closes is flushed as a final line.
async fn pump_lines(
    mut chunks: mpsc::Receiver<(Stream, Vec<u8>)>,
    ring: SharedRing,
    forward: bool,
) {
    let mut partials: HashMap<Stream, Vec<u8>> = HashMap::new();
    while let Some((stream, chunk)) = chunks.recv().await {
        let partial = partials.entry(stream).or_default();
        partial.extend_from_slice(&chunk);
        while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            emit(&ring, stream, &line, forward);
        }
    }
    for (stream, partial) in partials {
        if !partial.is_empty() {
            emit(&ring, stream, &partial, forward);
        }
    }
}

fn emit(ring: &SharedRing, stream: Stream, line: &[u8], forward: bool) {
    let text = String::from_utf8_lossy(line).into_owned();
    if forward {
        match stream {
            Stream::Stderr => eprintln!("{text}"),
            _ => println!("{text}"),
        }
    }
    ring.lock().unwrap().append(text, stream);
}

/// Quote a command vector for `/bin/sh -lc`.
fn shell_quote(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| format!("'{}'", arg.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

enum KillResult {
    Delivered,
    NoSuchProcess,
    Failed,
}

fn kill(pid: pid_t, signal: i32) -> KillResult {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        KillResult::Delivered
    } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
        KillResult::NoSuchProcess
    } else {
        KillResult::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring;
    use crate::test_utils::{assert_eventually, assert_eventually_bool};

    fn sh(script: &str) -> ChildSpec {
        ChildSpec {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            cwd: None,
            env: Vec::new(),
            use_pty: false,
        }
    }

    fn texts(ring: &SharedRing) -> Vec<String> {
        ring.lock()
            .unwrap()
            .query(&Default::default())
            .events
            .iter()
            .map(|e| e.text.clone())
            .collect()
    }

    #[tokio::test]
    async fn captures_stdout_lines_in_order() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("echo 'line 1'; echo 'line 2'"), Arc::clone(&ring), false);
        sup.start().await.unwrap();

        assert_eventually(
            "both lines captured",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move {
                    let got = texts(&ring);
                    if got == vec!["line 1", "line 2"] {
                        Ok(())
                    } else {
                        Err(format!("buffer holds {got:?}"))
                    }
                }
            },
        )
        .await;

        let events = ring.lock().unwrap().query(&Default::default()).events;
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert!(events.iter().all(|e| e.stream == Stream::Stdout));
    }

    #[tokio::test]
    async fn labels_stderr_separately() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("echo out; echo err >&2"), Arc::clone(&ring), false);
        sup.start().await.unwrap();

        assert_eventually_bool(
            "stderr line captured",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move {
                    ring.lock()
                        .unwrap()
                        .query(&Default::default())
                        .events
                        .iter()
                        .any(|e| e.stream == Stream::Stderr && e.text == "err")
                }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn flushes_partial_line_on_exit() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("printf 'no newline'"), Arc::clone(&ring), false);
        sup.start().await.unwrap();

        assert_eventually_bool(
            "partial line flushed",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move { texts(&ring) == vec!["no newline"] }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn trims_carriage_returns() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("printf 'crlf line\\r\\n'"), Arc::clone(&ring), false);
        sup.start().await.unwrap();

        assert_eventually_bool(
            "crlf trimmed",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move { texts(&ring) == vec!["crlf line"] }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn records_exit_code() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("exit 3"), Arc::clone(&ring), false);
        sup.start().await.unwrap();

        assert_eventually(
            "exit recorded",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || async {
                let st = sup.state();
                match st.state {
                    ProcState::Exited if st.exit_code == Some(3) => Ok(()),
                    _ => Err(format!("state {:?} code {:?}", st.state, st.exit_code)),
                }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn stop_terminates_gracefully() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("sleep 30"), Arc::clone(&ring), false);
        let pid = sup.start().await.unwrap();

        sup.stop(2000).await.unwrap();
        let st = sup.state();
        assert_eq!(st.state, ProcState::Stopped);
        assert!(st.pid.is_none());
        // The group must be gone.
        assert!(matches!(
            kill(-(pid as pid_t), 0),
            KillResult::NoSuchProcess
        ));
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let ring = ring::shared(100, 100_000);
        // Child ignores SIGTERM, so only the escalation can end it.
        let sup = Supervisor::new(
            sh("trap '' TERM; while :; do sleep 1; done"),
            Arc::clone(&ring),
            false,
        );
        sup.start().await.unwrap();

        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.stop(300).await.unwrap();
        assert_eq!(sup.state().state, ProcState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_child_is_a_noop() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("true"), Arc::clone(&ring), false);
        sup.stop(100).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_records_synthetic_exit() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(
            ChildSpec {
                command: vec!["/nonexistent/definitely-not-a-binary".into()],
                cwd: None,
                env: Vec::new(),
                use_pty: false,
            },
            Arc::clone(&ring),
            false,
        );
        assert!(sup.start().await.is_err());
        let st = sup.state();
        assert_eq!(st.state, ProcState::Exited);
        assert_eq!(st.exit_code, Some(1));
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(
            ChildSpec {
                command: vec!["/bin/sh".into(), "-c".into(), "echo \"V=$TAP_TEST_VAR\"".into()],
                cwd: None,
                env: vec![("TAP_TEST_VAR".into(), "hello".into())],
                use_pty: false,
            },
            Arc::clone(&ring),
            false,
        );
        sup.start().await.unwrap();

        assert_eventually_bool(
            "env override visible",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move { texts(&ring).contains(&"V=hello".to_string()) }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn marker_inserted_between_spawn_and_supervise_precedes_output() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(sh("echo first; echo second"), Arc::clone(&ring), false);

        let spawned = sup.spawn().await.unwrap();
        let marker = ring.lock().unwrap().insert_marker("--- marker ---");
        sup.supervise(spawned).await;

        assert_eventually_bool(
            "child output after marker",
            Duration::from_secs(5),
            Duration::from_millis(25),
            || {
                let ring = Arc::clone(&ring);
                async move { texts(&ring).len() == 3 }
            },
        )
        .await;

        let events = ring.lock().unwrap().query(&Default::default()).events;
        assert_eq!(events[0].seq, marker.seq);
        assert!(events[1..].iter().all(|e| e.seq > marker.seq));
        assert_eq!(events[1].text, "first");
    }

    #[tokio::test]
    async fn pty_mode_produces_combined_stream() {
        let ring = ring::shared(100, 100_000);
        let sup = Supervisor::new(
            ChildSpec {
                command: vec!["/bin/sh".into(), "-c".into(), "echo out; echo err >&2".into()],
                cwd: None,
                env: Vec::new(),
                use_pty: true,
            },
            Arc::clone(&ring),
            false,
        );
        sup.start().await.unwrap();

        assert_eventually_bool(
            "pty lines captured as combined",
            Duration::from_secs(10),
            Duration::from_millis(50),
            || {
                let ring = Arc::clone(&ring);
                async move {
                    let events = ring.lock().unwrap().query(&Default::default()).events;
                    let texts: Vec<_> = events.iter().map(|e| e.text.as_str().to_string()).collect();
                    texts.iter().any(|t| t.contains("out"))
                        && texts.iter().any(|t| t.contains("err"))
                        && events.iter().all(|e| e.stream == Stream::Combined)
                }
            },
        )
        .await;

        sup.stop(1000).await.unwrap();
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        let quoted = shell_quote(&["echo".into(), "it's".into()]);
        assert_eq!(quoted, r"'echo' 'it'\''s'");
    }
}
