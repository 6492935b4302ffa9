// Shared helpers for the tap and tap-runner binaries: duration strings,
// KEY=VALUE pairs, and env-file parsing.

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Parse a duration string into milliseconds. Accepts `250ms`, `5s`, `2m`,
/// `1h`, or a bare integer (milliseconds).
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let s = input.trim();
    let (digits, factor) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (s, 1)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration: {input}"))?;
    Ok(value * factor)
}

/// Parse a `KEY=VALUE` argument.
pub fn parse_env_pair(input: &str) -> Result<(String, String)> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected KEY=VALUE, got '{input}'"),
    }
}

/// Read an env file: one `KEY=VALUE` per line, `#` comments and blank
/// lines skipped, an optional `export ` prefix tolerated, matching outer
/// quotes stripped from values.
pub fn parse_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;
    let mut pairs = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "{}:{}: expected KEY=VALUE, got '{line}'",
                path.display(),
                number + 1
            );
        };
        pairs.push((key.trim().to_string(), unquote(value.trim()).to_string()));
    }
    Ok(pairs)
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return &value[1..value.len() - 1];
        }
    }
    value
}
