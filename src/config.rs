// Path derivation for tap directories, control sockets, and the client
// cursor cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::validate::{split_name, validate_service_name};

/// Directory name holding one socket per service.
pub const TAP_DIR_NAME: &str = ".tap";
/// Suffix of every control socket.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Filesystem locations for one service: its tap directory and socket.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub name: String,
    pub base_name: String,
    pub tap_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl ServicePaths {
    /// Derive the socket location for a composed name under a workspace
    /// base directory; prefix segments become subdirectories
    /// (`frontend:api` lives at `<base>/frontend/.tap/api.sock`).
    pub fn for_name(base: &Path, name: &str) -> Result<Self> {
        validate_service_name(name)?;
        let (prefix, base_name) = split_name(name);
        let mut dir = base.to_path_buf();
        if let Some(prefix) = prefix {
            for segment in prefix.split('/') {
                dir.push(segment);
            }
        }
        let tap_dir = dir.join(TAP_DIR_NAME);
        let socket_path = tap_dir.join(format!("{base_name}{SOCKET_SUFFIX}"));
        Ok(Self {
            name: name.to_string(),
            base_name: base_name.to_string(),
            tap_dir,
            socket_path,
        })
    }

    /// Use an explicit tap directory, skipping workspace derivation. Only
    /// the base name (after the last `:`) selects the socket.
    pub fn in_tap_dir(tap_dir: &Path, name: &str) -> Result<Self> {
        validate_service_name(name)?;
        let (_, base_name) = split_name(name);
        let socket_path = tap_dir.join(format!("{base_name}{SOCKET_SUFFIX}"));
        Ok(Self {
            name: name.to_string(),
            base_name: base_name.to_string(),
            tap_dir: tap_dir.to_path_buf(),
            socket_path,
        })
    }

    /// Create the tap directory with owner-only permissions.
    pub fn ensure_tap_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tap_dir)
            .with_context(|| format!("failed to create {}", self.tap_dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.tap_dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| {
                    format!("failed to set permissions on {}", self.tap_dir.display())
                })?;
        }
        Ok(())
    }
}

/// Location of the observe-client cursor cache. `TAP_CACHE_DIR` overrides
/// the platform cache directory (mainly for tests).
pub fn cursor_cache_path() -> PathBuf {
    if let Ok(dir) = std::env::var("TAP_CACHE_DIR") {
        return PathBuf::from(dir).join("cursors.json");
    }
    dirs::cache_dir()
        .map(|d| d.join("tap").join("cursors.json"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tap/cursors.json"))
}
