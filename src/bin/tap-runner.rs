// tap-runner: per-service daemon that owns one supervised child and
// serves the control API on <tap_dir>/<name>.sock.
//
// Usage:
//   tap-runner <name> [OPTIONS] -- <command> [args...]
//
// The tap CLI normally launches this detached; running it in the
// foreground works the same way and logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use tap::cli::{parse_env_file, parse_env_pair};
use tap::config::ServicePaths;
use tap::ring;
use tap::server::{self, RunnerState};
use tap::supervisor::{ChildSpec, Supervisor};

/// Grace given to the child when the runner itself is told to shut down.
const SHUTDOWN_GRACE_MS: u64 = 2000;

struct RunnerArgs {
    name: String,
    base_dir: PathBuf,
    tap_dir: Option<PathBuf>,
    pty: bool,
    forward: bool,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    max_lines: usize,
    max_bytes: usize,
    command: Vec<String>,
}

fn print_help() {
    println!(
        r#"tap-runner - per-service daemon supervising one command

USAGE:
    tap-runner <name> [OPTIONS] -- <command> [args...]

OPTIONS:
    --dir <path>        Workspace base directory (default: current directory)
    --tap-dir <path>    Explicit tap directory (skips workspace derivation)
    --pty               Run the command under a pseudo-terminal
    --forward           Echo captured lines to the runner's own stdio
    --cwd <path>        Working directory for the child
    --env KEY=VALUE     Environment override (repeatable)
    --env-file <path>   Load KEY=VALUE overrides from a file
    --max-lines <n>     Ring buffer line cap (default {})
    --max-bytes <n>     Ring buffer byte cap (default {})
    --help              Show this help

EXAMPLES:
    tap-runner api -- npm run dev
    tap-runner frontend:api --pty -- cargo run
    tap-runner worker --env-file .env -- ./worker --queue jobs
"#,
        ring::DEFAULT_MAX_LINES,
        ring::DEFAULT_MAX_BYTES,
    );
}

fn parse_args(args: &[String]) -> Result<RunnerArgs> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut pty = false;
    let mut forward = false;
    let mut cwd: Option<PathBuf> = None;
    let mut env: Vec<(String, String)> = Vec::new();
    let mut max_lines = ring::DEFAULT_MAX_LINES;
    let mut max_bytes = ring::DEFAULT_MAX_BYTES;
    let mut command: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            }
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--pty" => pty = true,
            "--forward" => forward = true,
            "--cwd" => cwd = Some(PathBuf::from(take_value(args, &mut i, "--cwd")?)),
            "--env" => env.push(parse_env_pair(&take_value(args, &mut i, "--env")?)?),
            "--env-file" => {
                let path = PathBuf::from(take_value(args, &mut i, "--env-file")?);
                env.extend(parse_env_file(&path)?);
            }
            "--max-lines" => {
                max_lines = take_value(args, &mut i, "--max-lines")?
                    .parse()
                    .context("--max-lines expects an integer")?;
            }
            "--max-bytes" => {
                max_bytes = take_value(args, &mut i, "--max-bytes")?
                    .parse()
                    .context("--max-bytes expects an integer")?;
            }
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            _ if name.is_none() => name = Some(arg.clone()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    let name = name.context("missing service name")?;
    if command.is_empty() {
        bail!("missing child command (everything after '--')");
    }
    let base_dir = match base_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    Ok(RunnerArgs {
        name,
        base_dir,
        tap_dir,
        pty,
        forward,
        cwd,
        env,
        max_lines,
        max_bytes,
        command,
    })
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{flag} requires a value"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.is_empty() || raw[0] == "--help" || raw[0] == "-h" || raw[0] == "help" {
        print_help();
        return Ok(());
    }
    let args = parse_args(&raw)?;

    let paths = match &args.tap_dir {
        Some(dir) => ServicePaths::in_tap_dir(dir, &args.name)?,
        None => ServicePaths::for_name(&args.base_dir, &args.name)?,
    };
    paths.ensure_tap_dir()?;

    // Bind first so a second runner for the same name fails fast with
    // runner_exists instead of spawning a duplicate child.
    let listener = server::bind_socket(&paths.socket_path)?;

    let ring = ring::shared(args.max_lines, args.max_bytes);
    let spec = ChildSpec {
        command: args.command.clone(),
        cwd: args.cwd.clone(),
        env: args.env.clone(),
        use_pty: args.pty,
    };
    let supervisor = Supervisor::new(spec, Arc::clone(&ring), args.forward);
    let started_at = ring::now_ms();

    match supervisor.start().await {
        Ok(pid) => {
            eprintln!(
                "tap-runner: started '{}' (pid {pid})",
                args.command.join(" ")
            );
        }
        Err(e) => {
            let _ = std::fs::remove_file(&paths.socket_path);
            return Err(e.context("child failed to spawn"));
        }
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(RunnerState {
        name: args.name.clone(),
        started_at,
        pty: args.pty,
        forward: args.forward,
        ring,
        supervisor,
        shutdown: shutdown.clone(),
    });

    // SIGINT/SIGTERM both funnel into the shutdown token; repeated
    // signals are harmless.
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            signalled.cancel();
        }
    });

    eprintln!(
        "tap-runner: serving '{}' on {}",
        args.name,
        paths.socket_path.display()
    );
    server::serve(Arc::clone(&state), listener).await;

    // Teardown; the stop endpoint may already have done the child half.
    state.supervisor.stop(SHUTDOWN_GRACE_MS).await.ok();
    let _ = std::fs::remove_file(&paths.socket_path);
    eprintln!("tap-runner: stopped '{}'", args.name);
    Ok(())
}
