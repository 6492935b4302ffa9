// Service discovery: a bounded-depth walk mapping service names to control
// sockets across a workspace.
//
// The walk is best-effort: unreadable directories are skipped and the scan
// continues, so a permission error in one subtree never hides the rest.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::{ServicePaths, SOCKET_SUFFIX, TAP_DIR_NAME};
use crate::validate::validate_service_name;

/// How deep below the base directory the walk descends.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// A `.tap` directory found during the walk. `prefix` is the base-relative
/// path of its parent, empty at the workspace root.
#[derive(Debug, Clone)]
pub struct TapDir {
    pub path: PathBuf,
    pub prefix: String,
}

/// One service: its composed name and where its socket lives.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub name: String,
    pub socket_path: PathBuf,
    pub tap_dir: PathBuf,
    pub prefix: String,
    pub base_name: String,
}

/// Where a name resolved to. `found` is false when no live service
/// matched and `socket_path` is the location a runner for that name would
/// use, so callers can render a useful "no runner" message.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub name: String,
    pub socket_path: PathBuf,
    pub found: bool,
}

/// Find every `.tap` directory under `base`, up to `max_depth` levels
/// down. Skips `node_modules` and dot-entries other than `.tap` itself.
pub fn find_tap_dirs(base: &Path, max_depth: usize) -> Vec<TapDir> {
    let base = canonical(base);
    let mut found = Vec::new();
    walk(&base, &base, 0, max_depth, &mut found);
    found
}

fn walk(base: &Path, dir: &Path, depth: usize, max_depth: usize, found: &mut Vec<TapDir>) {
    if depth > max_depth {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !file_type.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name == "node_modules" {
            continue;
        }
        if name.starts_with('.') {
            if name == TAP_DIR_NAME {
                let prefix = dir
                    .strip_prefix(base)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                found.push(TapDir {
                    path: entry.path(),
                    prefix,
                });
            }
            continue;
        }
        walk(base, &entry.path(), depth + 1, max_depth, found);
    }
}

/// Enumerate services: every `*.sock` entry of every discovered `.tap`
/// directory, with composed names (`prefix:base`, bare base at the root).
pub fn list_services(base: &Path, max_depth: usize) -> Vec<DiscoveredService> {
    let mut services = Vec::new();
    for tap_dir in find_tap_dirs(base, max_depth) {
        let entries = match std::fs::read_dir(&tap_dir.path) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(base_name) = file_name.strip_suffix(SOCKET_SUFFIX) else {
                continue;
            };
            if base_name.is_empty() {
                continue;
            }
            let name = if tap_dir.prefix.is_empty() {
                base_name.to_string()
            } else {
                format!("{}:{}", tap_dir.prefix, base_name)
            };
            services.push(DiscoveredService {
                name,
                socket_path: entry.path(),
                tap_dir: tap_dir.path.clone(),
                prefix: tap_dir.prefix.clone(),
                base_name: base_name.to_string(),
            });
        }
    }
    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}

/// Resolve a user-supplied name to a socket path. An explicit `tap_dir`
/// skips discovery entirely; otherwise an exact composed-name match wins,
/// then a unique base-name match for colon-free names.
pub fn resolve(base: &Path, name: &str, tap_dir: Option<&Path>) -> Result<Resolution> {
    validate_service_name(name)?;

    if let Some(dir) = tap_dir {
        let paths = ServicePaths::in_tap_dir(dir, name)?;
        let found = paths.socket_path.exists();
        return Ok(Resolution {
            name: name.to_string(),
            socket_path: paths.socket_path,
            found,
        });
    }

    let services = list_services(base, DEFAULT_MAX_DEPTH);
    if let Some(service) = services.iter().find(|s| s.name == name) {
        return Ok(Resolution {
            name: service.name.clone(),
            socket_path: service.socket_path.clone(),
            found: true,
        });
    }
    if !name.contains(':') {
        let matches: Vec<_> = services.iter().filter(|s| s.base_name == name).collect();
        if matches.len() == 1 {
            let service = matches[0];
            return Ok(Resolution {
                name: service.name.clone(),
                socket_path: service.socket_path.clone(),
                found: true,
            });
        }
    }

    // Nothing matched: hand back the path a runner for this name would
    // bind, so the caller can explain where it looked.
    let paths = ServicePaths::for_name(&canonical(base), name)?;
    Ok(Resolution {
        name: name.to_string(),
        socket_path: paths.socket_path,
        found: false,
    })
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
