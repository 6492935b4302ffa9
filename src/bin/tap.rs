// tap: CLI for starting and querying per-service runners.
//
// Commands:
//   tap run <name> [opts] -- <command...>   start a detached runner
//   tap status <name>                       runner + child + buffer summary
//   tap logs <name> [filters]               one-shot log query
//   tap observe <name>                      follow logs, resuming from a cursor
//   tap restart <name> [--ready <pattern>]  restart, optionally await readiness
//   tap stop <name>                         stop the child and the runner
//   tap list                                discover services in the workspace

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use tap::cli::{parse_duration_ms, parse_env_pair};
use tap::client::{launch_runner, LogsQuery, RunnerClient};
use tap::config::ServicePaths;
use tap::cursors::CursorCache;
use tap::discovery::{self, Resolution};
use tap::protocol::{ReadyKind, ReadySpec, RestartRequest, RunnerStatus};

fn print_help() {
    println!(
        r#"tap - supervise a command and query its output

USAGE:
    tap <COMMAND> [OPTIONS]

COMMANDS:
    run <name> -- <cmd...>   Start a runner for <cmd> and detach
    status <name>            Show runner, child, and buffer state
    logs <name>              Query captured log lines
    observe <name>           Follow new lines, resuming from the last cursor
    restart <name>           Restart the child, optionally waiting for readiness
    stop <name>              Stop the child and shut the runner down
    list                     Discover services under the workspace
    help                     Show this help message

COMMON OPTIONS:
    --dir <path>        Workspace base directory (default: current directory)
    --tap-dir <path>    Explicit tap directory (skips discovery)
    --json              Print the raw JSON response

RUN OPTIONS:
    --pty               Run the command under a pseudo-terminal
    --forward           Runner echoes captured lines to its own stdio
    --cwd <path>        Working directory for the child
    --env KEY=VALUE     Environment override (repeatable)
    --env-file <path>   Load overrides from a file
    --max-lines <n>     Ring buffer line cap
    --max-bytes <n>     Ring buffer byte cap

LOGS/OBSERVE OPTIONS:
    --last <n>             Trailing window of n lines
    --since-cursor <seq>   Events at or after a cursor
    --since <duration>     Events newer than e.g. 30s, 5m
    --stream <s>           stdout | stderr | combined
    --grep <pattern>       Substring filter (--regex for a regular expression)
    --regex                Treat --grep as a regular expression
    --case-sensitive       Match case-sensitively
    --invert               Keep non-matching lines
    --interval <duration>  Poll interval for observe (default 1s)
    --reset                Observe from scratch, ignoring the cached cursor

RESTART OPTIONS:
    --grace <duration>     SIGTERM grace before SIGKILL (default 2s)
    --ready <pattern>      Wait for this pattern in post-restart output
    --ready-regex          Treat --ready as a regular expression
    --timeout <duration>   Readiness wait ceiling (default 20s)
    --clear-logs           Drop buffered lines from before the restart

EXAMPLES:
    tap run api -- npm run dev
    tap logs api --grep error --last 200
    tap restart api --ready "listening on" --timeout 30s
    tap observe frontend:api
    tap stop api
"#
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_help();
        return Ok(());
    };
    match command.as_str() {
        "run" => cmd_run(&args[1..]),
        "status" => cmd_status(&args[1..]),
        "logs" => cmd_logs(&args[1..]),
        "observe" => cmd_observe(&args[1..]),
        "restart" => cmd_restart(&args[1..]),
        "stop" => cmd_stop(&args[1..]),
        "list" => cmd_list(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown command: {other}")
        }
    }
}

/// Which runner a command is aimed at, before resolution.
struct Target {
    name: String,
    base_dir: PathBuf,
    tap_dir: Option<PathBuf>,
}

impl Target {
    fn resolve(&self) -> Result<Resolution> {
        discovery::resolve(&self.base_dir, &self.name, self.tap_dir.as_deref())
    }

    /// Resolve to a live service or fail with a `no_runner` hint naming
    /// the socket path that was expected.
    fn client(&self) -> Result<RunnerClient> {
        let resolution = self.resolve()?;
        if !resolution.found {
            bail!(
                "no_runner: no runner for '{}' (expected socket at {})",
                self.name,
                resolution.socket_path.display()
            );
        }
        Ok(RunnerClient::new(resolution.name, resolution.socket_path))
    }
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{flag} requires a value"))
}

fn default_base_dir() -> Result<PathBuf> {
    std::env::current_dir().context("failed to resolve current directory")
}

fn cmd_run(args: &[String]) -> Result<()> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut pty = false;
    let mut forward = false;
    let mut cwd: Option<String> = None;
    let mut env: Vec<(String, String)> = Vec::new();
    let mut env_file: Option<String> = None;
    let mut max_lines: Option<String> = None;
    let mut max_bytes: Option<String> = None;
    let mut command: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            }
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--pty" => pty = true,
            "--forward" => forward = true,
            "--cwd" => cwd = Some(take_value(args, &mut i, "--cwd")?),
            "--env" => {
                let pair = take_value(args, &mut i, "--env")?;
                env.push(parse_env_pair(&pair)?);
            }
            "--env-file" => env_file = Some(take_value(args, &mut i, "--env-file")?),
            "--max-lines" => max_lines = Some(take_value(args, &mut i, "--max-lines")?),
            "--max-bytes" => max_bytes = Some(take_value(args, &mut i, "--max-bytes")?),
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            arg if name.is_none() => name = Some(arg.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    let name = name.context("missing service name")?;
    if command.is_empty() {
        bail!("missing command (everything after '--')");
    }
    let base_dir = match base_dir {
        Some(dir) => dir.canonicalize().unwrap_or(dir),
        None => default_base_dir()?,
    };

    let paths = match &tap_dir {
        Some(dir) => ServicePaths::in_tap_dir(dir, &name)?,
        None => ServicePaths::for_name(&base_dir, &name)?,
    };

    // Fail fast if a runner already answers on this socket.
    if paths.socket_path.exists() {
        let probe = RunnerClient::new(&name, &paths.socket_path);
        if probe.status().is_ok() {
            bail!(
                "runner_exists: '{}' is already running (socket {})",
                name,
                paths.socket_path.display()
            );
        }
    }

    let mut runner_args = vec![name.clone(), "--dir".into(), base_dir.display().to_string()];
    if let Some(dir) = &tap_dir {
        runner_args.push("--tap-dir".into());
        runner_args.push(dir.display().to_string());
    }
    if pty {
        runner_args.push("--pty".into());
    }
    if forward {
        runner_args.push("--forward".into());
    }
    if let Some(cwd) = cwd {
        runner_args.push("--cwd".into());
        runner_args.push(cwd);
    }
    for (key, value) in &env {
        runner_args.push("--env".into());
        runner_args.push(format!("{key}={value}"));
    }
    if let Some(path) = env_file {
        runner_args.push("--env-file".into());
        runner_args.push(path);
    }
    if let Some(n) = max_lines {
        runner_args.push("--max-lines".into());
        runner_args.push(n);
    }
    if let Some(n) = max_bytes {
        runner_args.push("--max-bytes".into());
        runner_args.push(n);
    }
    runner_args.push("--".into());
    runner_args.extend(command);

    launch_runner(&runner_args, &paths.socket_path)?;

    let status = RunnerClient::new(&name, &paths.socket_path).status()?;
    match status.child_pid {
        Some(pid) => println!("started '{name}' (child pid {pid})"),
        None => println!("started '{name}' (child state {})", status.child_state),
    }
    println!("socket: {}", paths.socket_path.display());
    Ok(())
}

fn cmd_status(args: &[String]) -> Result<()> {
    let (target, json) = parse_target(args, "status")?;
    let client = target.client()?;
    let status = client.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &RunnerStatus) {
    println!("name:        {}", status.name);
    match status.child_pid {
        Some(pid) => println!("state:       {} (pid {pid})", status.child_state),
        None => println!("state:       {}", status.child_state),
    }
    println!("runner pid:  {}", status.runner_pid);
    println!("uptime:      {}s", status.uptime_ms / 1000);
    println!(
        "mode:        {}{}",
        if status.pty { "pty" } else { "pipes" },
        if status.forward { " +forward" } else { "" }
    );
    println!(
        "buffer:      {} lines / {} bytes (caps {} / {})",
        status.buffer.current_lines,
        status.buffer.current_bytes,
        status.buffer.max_lines,
        status.buffer.max_bytes
    );
    match (status.last_exit.code, status.last_exit.signal) {
        (Some(code), _) => println!("last exit:   code {code}"),
        (None, Some(signal)) => println!("last exit:   signal {signal}"),
        (None, None) => {}
    }
}

/// Shared flag loop for commands that take a name plus common options.
fn parse_target(args: &[String], command: &str) -> Result<(Target, bool)> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut json = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--json" => json = true,
            flag if flag.starts_with("--") => bail!("unknown option for {command}: {flag}"),
            arg if name.is_none() => name = Some(arg.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    let target = Target {
        name: name.with_context(|| format!("missing service name for {command}"))?,
        base_dir: match base_dir {
            Some(dir) => dir,
            None => default_base_dir()?,
        },
        tap_dir,
    };
    Ok((target, json))
}

struct LogsArgs {
    target: Target,
    query: LogsQuery,
    json: bool,
    interval: Duration,
    reset: bool,
}

fn parse_logs_args(args: &[String], command: &str) -> Result<LogsArgs> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut query = LogsQuery::default();
    let mut interval = Duration::from_secs(1);
    let mut reset = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--json" => json = true,
            "--last" => {
                query.last = Some(
                    take_value(args, &mut i, "--last")?
                        .parse()
                        .context("--last expects an integer")?,
                );
            }
            "--since-cursor" => {
                query.since_cursor = Some(
                    take_value(args, &mut i, "--since-cursor")?
                        .parse()
                        .context("--since-cursor expects an integer")?,
                );
            }
            "--since" => {
                query.since_ms = Some(parse_duration_ms(&take_value(args, &mut i, "--since")?)?);
            }
            "--stream" => query.stream = Some(take_value(args, &mut i, "--stream")?),
            "--grep" => query.grep = Some(take_value(args, &mut i, "--grep")?),
            "--regex" => query.regex = true,
            "--case-sensitive" => query.case_sensitive = true,
            "--invert" => query.invert = true,
            "--max-lines" => {
                query.max_lines = Some(
                    take_value(args, &mut i, "--max-lines")?
                        .parse()
                        .context("--max-lines expects an integer")?,
                );
            }
            "--max-bytes" => {
                query.max_bytes = Some(
                    take_value(args, &mut i, "--max-bytes")?
                        .parse()
                        .context("--max-bytes expects an integer")?,
                );
            }
            "--interval" => {
                interval =
                    Duration::from_millis(parse_duration_ms(&take_value(args, &mut i, "--interval")?)?);
            }
            "--reset" => reset = true,
            flag if flag.starts_with("--") => bail!("unknown option for {command}: {flag}"),
            arg if name.is_none() => name = Some(arg.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    Ok(LogsArgs {
        target: Target {
            name: name.with_context(|| format!("missing service name for {command}"))?,
            base_dir: match base_dir {
                Some(dir) => dir,
                None => default_base_dir()?,
            },
            tap_dir,
        },
        query,
        json,
        interval,
        reset,
    })
}

fn cmd_logs(args: &[String]) -> Result<()> {
    let parsed = parse_logs_args(args, "logs")?;
    let client = parsed.target.client()?;
    let response = client.logs(&parsed.query)?;
    if parsed.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    if response.dropped {
        eprintln!("tap: some events were evicted before the requested cursor");
    }
    for event in &response.events {
        println!("{}", event.text);
    }
    if response.truncated {
        eprintln!(
            "tap: output truncated; continue with --since-cursor {}",
            response.cursor_next
        );
    }
    Ok(())
}

fn cmd_observe(args: &[String]) -> Result<()> {
    let parsed = parse_logs_args(args, "observe")?;
    let resolution = parsed.target.resolve()?;
    if !resolution.found {
        bail!(
            "no_runner: no runner for '{}' (expected socket at {})",
            parsed.target.name,
            resolution.socket_path.display()
        );
    }
    let tap_dir = resolution
        .socket_path
        .parent()
        .map(Path::to_path_buf)
        .context("socket path has no parent directory")?;
    let key = CursorCache::key(&tap_dir, &resolution.name);
    let mut cache = CursorCache::open();
    let mut cursor = if parsed.reset { None } else { cache.get(&key) };

    let client = RunnerClient::new(resolution.name.clone(), resolution.socket_path.clone());
    loop {
        let mut query = parsed.query.clone();
        query.since_cursor = cursor;
        let response = client.logs(&query)?;
        if response.dropped {
            if let Some(cursor) = cursor {
                eprintln!("tap: events were evicted before cursor {cursor}");
            }
        }
        for event in &response.events {
            println!("{}", event.text);
        }
        cursor = Some(response.cursor_next);
        cache.set(key.clone(), response.cursor_next);
        if let Err(e) = cache.save() {
            eprintln!("tap: failed to persist cursor cache: {e:#}");
        }
        std::thread::sleep(parsed.interval);
    }
}

fn cmd_restart(args: &[String]) -> Result<()> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut request = RestartRequest::default();
    let mut ready_pattern: Option<String> = None;
    let mut ready_regex = false;
    let mut case_sensitive = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--json" => json = true,
            "--grace" => {
                request.grace_ms = Some(parse_duration_ms(&take_value(args, &mut i, "--grace")?)?);
            }
            "--timeout" => {
                request.timeout_ms =
                    Some(parse_duration_ms(&take_value(args, &mut i, "--timeout")?)?);
            }
            "--ready" => ready_pattern = Some(take_value(args, &mut i, "--ready")?),
            "--ready-regex" => ready_regex = true,
            "--case-sensitive" => case_sensitive = true,
            "--clear-logs" => request.clear_logs = true,
            flag if flag.starts_with("--") => bail!("unknown option for restart: {flag}"),
            arg if name.is_none() => name = Some(arg.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    if let Some(pattern) = ready_pattern {
        request.ready = Some(ReadySpec {
            kind: if ready_regex {
                ReadyKind::Regex
            } else {
                ReadyKind::Substring
            },
            pattern,
            case_sensitive,
        });
    }

    let target = Target {
        name: name.context("missing service name for restart")?,
        base_dir: match base_dir {
            Some(dir) => dir,
            None => default_base_dir()?,
        },
        tap_dir,
    };
    let client = target.client()?;
    let response = client.restart(&request)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let pid = response
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "?".to_string());
    if response.ready {
        match &response.ready_match {
            Some(text) => println!("restarted (pid {pid}); ready: {text}"),
            None => println!("restarted (pid {pid})"),
        }
    } else {
        println!(
            "restarted (pid {pid}) but readiness timed out ({})",
            response.reason.as_deref().unwrap_or("timeout")
        );
        if let Some(snippet) = &response.snippet {
            for line in snippet {
                println!("  {line}");
            }
        }
    }
    println!("cursor: {}", response.cursor_next);
    Ok(())
}

fn cmd_stop(args: &[String]) -> Result<()> {
    let mut name: Option<String> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut tap_dir: Option<PathBuf> = None;
    let mut grace_ms: Option<u64> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--tap-dir" => tap_dir = Some(PathBuf::from(take_value(args, &mut i, "--tap-dir")?)),
            "--grace" => grace_ms = Some(parse_duration_ms(&take_value(args, &mut i, "--grace")?)?),
            flag if flag.starts_with("--") => bail!("unknown option for stop: {flag}"),
            arg if name.is_none() => name = Some(arg.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
        i += 1;
    }

    let target = Target {
        name: name.context("missing service name for stop")?,
        base_dir: match base_dir {
            Some(dir) => dir,
            None => default_base_dir()?,
        },
        tap_dir,
    };
    let client = target.client()?;
    let response = client.stop(grace_ms)?;
    if response.stopped {
        println!("stopped '{}'", target.name);
    }
    Ok(())
}

fn cmd_list(args: &[String]) -> Result<()> {
    let mut base_dir: Option<PathBuf> = None;
    let mut json = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => base_dir = Some(PathBuf::from(take_value(args, &mut i, "--dir")?)),
            "--json" => json = true,
            other => bail!("unknown option for list: {other}"),
        }
        i += 1;
    }
    let base_dir = match base_dir {
        Some(dir) => dir,
        None => default_base_dir()?,
    };

    let services = discovery::list_services(&base_dir, discovery::DEFAULT_MAX_DEPTH);
    if json {
        let mut entries = Vec::new();
        for service in &services {
            let client = RunnerClient::new(&service.name, &service.socket_path);
            let status = client.status().ok();
            entries.push(serde_json::json!({
                "name": service.name,
                "socket": service.socket_path,
                "status": status,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if services.is_empty() {
        println!("no services found under {}", base_dir.display());
        return Ok(());
    }
    for service in &services {
        let client = RunnerClient::new(&service.name, &service.socket_path);
        match client.status() {
            Ok(status) => match status.child_pid {
                Some(pid) => println!("{}  {} (pid {pid})", service.name, status.child_state),
                None => println!("{}  {}", service.name, status.child_state),
            },
            Err(_) => println!("{}  (not responding)", service.name),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_target_extracts_name_and_flags() {
        let (target, json) =
            parse_target(&strings(&["api", "--dir", "/ws", "--json"]), "status").unwrap();
        assert_eq!(target.name, "api");
        assert_eq!(target.base_dir, PathBuf::from("/ws"));
        assert!(target.tap_dir.is_none());
        assert!(json);
    }

    #[test]
    fn parse_target_requires_name() {
        assert!(parse_target(&strings(&["--json"]), "status").is_err());
    }

    #[test]
    fn parse_logs_args_builds_query() {
        let parsed = parse_logs_args(
            &strings(&[
                "api",
                "--grep",
                "error",
                "--regex",
                "--invert",
                "--last",
                "50",
                "--stream",
                "stderr",
                "--interval",
                "250ms",
            ]),
            "logs",
        )
        .unwrap();
        assert_eq!(parsed.target.name, "api");
        assert_eq!(parsed.query.grep.as_deref(), Some("error"));
        assert!(parsed.query.regex);
        assert!(parsed.query.invert);
        assert_eq!(parsed.query.last, Some(50));
        assert_eq!(parsed.query.stream.as_deref(), Some("stderr"));
        assert_eq!(parsed.interval, Duration::from_millis(250));
    }

    #[test]
    fn parse_logs_args_rejects_unknown_flags() {
        assert!(parse_logs_args(&strings(&["api", "--bogus"]), "logs").is_err());
    }
}
