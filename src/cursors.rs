// Client-side cursor cache for `tap observe`.
//
// A small JSON map from "<abs_tap_dir>:<service>" to the last cursor an
// observe loop handed out. Lives under the platform cache directory, file
// mode 0600 inside a 0700 directory. Anything at the path that is not a
// regular file is unlinked and treated as empty, as is corrupt JSON.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::config::cursor_cache_path;

#[derive(Debug)]
pub struct CursorCache {
    path: PathBuf,
    entries: HashMap<String, u64>,
}

impl CursorCache {
    /// Open the cache at the default platform path.
    pub fn open() -> Self {
        Self::open_at(cursor_cache_path())
    }

    pub fn open_at(path: PathBuf) -> Self {
        refuse_non_regular(&path);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    /// Cache key for one service under one tap directory.
    pub fn key(tap_dir: &Path, name: &str) -> String {
        format!("{}:{}", tap_dir.display(), name)
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn set(&mut self, key: String, cursor: u64) {
        self.entries.insert(key, cursor);
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Write the cache back with an exclusive lock, creating the cache
    /// directory (0700) and the file (0600) as needed.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("invalid cache path: {}", self.path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to set permissions on {}", parent.display()))?;
        }

        refuse_non_regular(&self.path);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.lock_exclusive()
            .context("failed to lock cursor cache")?;
        let contents = serde_json::to_string_pretty(&self.entries)
            .context("failed to serialize cursor cache")?;
        file.write_all(contents.as_bytes())
            .context("failed to write cursor cache")?;
        // Lock released when the file handle drops.
        Ok(())
    }
}

/// Unlink the path unless it is a regular file, so a planted symlink can
/// never redirect our read or write.
fn refuse_non_regular(path: &Path) {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if !meta.file_type().is_file() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_and_update() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cursors.json");

        let mut cache = CursorCache::open_at(path.clone());
        let key = CursorCache::key(Path::new("/ws/.tap"), "api");
        assert_eq!(cache.get(&key), None);
        cache.set(key.clone(), 42);
        cache.save().unwrap();

        let cache = CursorCache::open_at(path);
        assert_eq!(cache.get(&key), Some(42));
    }

    #[test]
    fn corrupt_json_is_treated_as_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cursors.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let cache = CursorCache::open_at(path);
        assert_eq!(cache.get("anything"), None);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_at_cache_path_is_unlinked() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target.json");
        std::fs::write(&target, b"{\"k\":1}").unwrap();
        let path = temp.path().join("cursors.json");
        std::os::unix::fs::symlink(&target, &path).unwrap();

        let cache = CursorCache::open_at(path.clone());
        assert_eq!(cache.get("k"), None);
        assert!(!path.exists(), "symlink must be removed");
        assert!(target.exists(), "symlink target must be untouched");
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache/cursors.json");

        let mut cache = CursorCache::open_at(path.clone());
        cache.set("k".into(), 1);
        cache.save().unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
