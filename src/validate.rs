// Service-name and pattern validation shared by the runner, the client
// CLI, and the service locator.
//
// Names are checked before any filesystem join; patterns are screened for
// catastrophic-backtracking signatures before they reach the regex engine.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Maximum length of a composed service name (`prefix:base`).
pub const MAX_NAME_LEN: usize = 128;
/// Maximum length of a single name segment.
pub const MAX_SEGMENT_LEN: usize = 64;
/// Maximum length of a user-supplied match pattern.
pub const MAX_PATTERN_LEN: usize = 200;

static SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("failed to compile segment matcher"));

/// Heuristic signatures of nested or ambiguous quantification. Patterns
/// matching any of these are rejected without being compiled.
static DANGEROUS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // adjacent quantified wildcards
        r"\.\*\.\*",
        r"\.\+\.\+",
        // bracket class flanked by quantifiers on both sides
        r"[*+]\[[^\]]*\]\.?[*+]",
        // quantifier applied to a group containing alternation
        r"\([^()]*\|[^()]*\)[*+{]",
        // consecutive counted quantifiers
        r"\{\d+(,\d+)?\}\{",
    ]
    .iter()
    .map(|sig| Regex::new(sig).expect("failed to compile pattern signature"))
    .collect()
});

/// Split a composed name into its optional prefix and base name. The
/// separator is the last `:`; the prefix itself may contain `/`.
pub fn split_name(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once(':') {
        Some((prefix, base)) => (Some(prefix), base),
        None => (None, name),
    }
}

/// Validate a service name (`base` or `prefix:base`, prefix segments
/// separated by `/`). Must be called before the name touches a path.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("service name is empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("service name exceeds {MAX_NAME_LEN} characters");
    }
    let (prefix, base) = split_name(name);
    let segments = prefix
        .map(|p| p.split('/').collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .chain(std::iter::once(base));
    for segment in segments {
        if segment.is_empty() || segment.len() > MAX_SEGMENT_LEN {
            bail!("name segment '{segment}' must be 1-{MAX_SEGMENT_LEN} characters");
        }
        if !SEGMENT.is_match(segment) {
            bail!("name segment '{segment}' may only contain letters, digits, '_' and '-'");
        }
    }
    Ok(())
}

/// Validate and compile a regex pattern. Rejects overlong patterns and the
/// backtracking signatures above; `case_sensitive = false` compiles with
/// `(?i)` semantics.
pub fn compile_pattern(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    if pattern.len() > MAX_PATTERN_LEN {
        bail!("pattern exceeds {MAX_PATTERN_LEN} characters");
    }
    for signature in DANGEROUS.iter() {
        if signature.is_match(pattern) {
            bail!("pattern rejected: nested or ambiguous quantification");
        }
    }
    let groups = pattern.matches('(').count();
    let quantified = pattern.contains('*') || pattern.contains('+') || pattern.contains('{');
    if groups > 3 && quantified {
        bail!("pattern rejected: too many groups combined with quantifiers");
    }
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .with_context(|| format!("pattern '{pattern}' failed to compile"))
}

/// Compiled match predicate shared by log queries and readiness waits.
#[derive(Debug, Clone)]
pub enum Matcher {
    Regex(Regex),
    Substring { needle: String, case_sensitive: bool },
}

impl Matcher {
    pub fn compile(pattern: &str, regex: bool, case_sensitive: bool) -> Result<Self> {
        if regex {
            Ok(Matcher::Regex(compile_pattern(pattern, case_sensitive)?))
        } else {
            let needle = if case_sensitive {
                pattern.to_string()
            } else {
                pattern.to_lowercase()
            };
            Ok(Matcher::Substring {
                needle,
                case_sensitive,
            })
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(text),
            Matcher::Substring {
                needle,
                case_sensitive,
            } => {
                if *case_sensitive {
                    text.contains(needle.as_str())
                } else {
                    text.to_lowercase().contains(needle.as_str())
                }
            }
        }
    }
}
