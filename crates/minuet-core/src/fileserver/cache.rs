//! In-memory asset store and the recursive directory scan that fills it.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use super::mime;
use crate::error::{MinuetError, MinuetResult};

pub const MAX_CACHED_FILES: usize = 1024;

/// One asset addressed by its logical (root-relative) path.
pub struct CachedFile {
    pub logical_path: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// On-disk mtime (seconds since epoch) at load time.
    pub last_modified: u64,
}

pub struct FileCache {
    entries: Vec<CachedFile>,
}

pub(crate) fn mtime_secs(path: &Path) -> MinuetResult<u64> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(mtime)
}

impl FileCache {
    pub fn new() -> Self {
        FileCache {
            entries: Vec::new(),
        }
    }

    pub fn find(&self, logical_path: &str) -> Option<&CachedFile> {
        self.entries
            .iter()
            .find(|f| f.logical_path == logical_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[CachedFile] {
        &self.entries
    }

    pub(crate) fn push(&mut self, file: CachedFile) -> MinuetResult<()> {
        if self.entries.len() >= MAX_CACHED_FILES {
            return Err(MinuetError::CacheFull);
        }
        self.entries.push(file);
        Ok(())
    }

    /// Read one file from disk into the cache under `logical_path`.
    /// Oversized files are skipped, not errors.
    pub fn load_file(
        &mut self,
        full_path: &Path,
        logical_path: &str,
        max_file_size: usize,
    ) -> MinuetResult<bool> {
        if self.entries.len() >= MAX_CACHED_FILES {
            return Err(MinuetError::CacheFull);
        }

        let last_modified = mtime_secs(full_path)?;
        let data = fs::read(full_path)?;
        if data.len() > max_file_size {
            debug!(
                target: "fileserver",
                path = %full_path.display(),
                size = data.len(),
                "file too large, skipping cache"
            );
            return Ok(false);
        }

        let entry = CachedFile {
            logical_path: logical_path.to_string(),
            mime_type: mime::mime_type(logical_path).to_string(),
            data,
            last_modified,
        };

        // A reload replaces the previous entry in place.
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|f| f.logical_path == logical_path)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
        debug!(target: "fileserver", logical_path, "cached file");
        Ok(true)
    }

    /// Recursive scan of `dir`, loading every regular file that is neither
    /// hidden nor excluded. `base` anchors the logical paths.
    pub fn scan_directory(
        &mut self,
        dir: &Path,
        base: &Path,
        max_file_size: usize,
        is_excluded: &dyn Fn(&str) -> bool,
    ) -> MinuetResult<()> {
        let entries = fs::read_dir(dir)?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }

            let full_path = entry.path();
            let rel = full_path
                .strip_prefix(base)
                .map_err(|e| MinuetError::Other(e.to_string()))?;
            let logical = format!("/{}", rel.to_string_lossy());

            let file_type = entry.file_type()?;
            if is_excluded(&logical) {
                debug!(target: "fileserver", logical = %logical, "excluded from cache");
                continue;
            }
            if file_type.is_dir() {
                self.scan_directory(&full_path, base, max_file_size, is_excluded)?;
            } else if file_type.is_file() {
                match self.load_file(&full_path, &logical, max_file_size) {
                    Ok(_) => {}
                    Err(MinuetError::CacheFull) => {
                        warn!(target: "fileserver", "cache entry ceiling reached, scan stopped");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(target: "fileserver", logical = %logical, "failed to cache: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap().write_all(contents).unwrap();
    }

    #[test]
    fn scan_builds_logical_paths() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "hello.css", b"body{color:red}\n");
        write_file(dir.path(), "img/logo.png", b"\x89PNG");
        write_file(dir.path(), ".hidden.css", b"x");

        let mut cache = FileCache::new();
        cache
            .scan_directory(dir.path(), dir.path(), 1024 * 1024, &|_| false)
            .unwrap();

        assert_eq!(cache.len(), 2);
        let css = cache.find("/hello.css").unwrap();
        assert_eq!(css.mime_type, "text/css");
        assert_eq!(css.data, b"body{color:red}\n");
        assert!(cache.find("/img/logo.png").is_some());
        assert!(cache.find("/.hidden.css").is_none());
    }

    #[test]
    fn scan_applies_exclusions() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app.js", b"x");
        write_file(dir.path(), "app.js.map", b"x");

        let mut cache = FileCache::new();
        cache
            .scan_directory(dir.path(), dir.path(), 1024, &|rel| rel.ends_with(".map"))
            .unwrap();

        assert!(cache.find("/app.js").is_some());
        assert!(cache.find("/app.js.map").is_none());
    }

    #[test]
    fn oversized_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "big.txt", &vec![b'x'; 100]);

        let mut cache = FileCache::new();
        cache
            .scan_directory(dir.path(), dir.path(), 10, &|_| false)
            .unwrap();
        assert!(cache.find("/big.txt").is_none());
    }

    #[test]
    fn reload_replaces_entry_in_place() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"one");

        let mut cache = FileCache::new();
        cache
            .load_file(&dir.path().join("a.txt"), "/a.txt", 1024)
            .unwrap();
        write_file(dir.path(), "a.txt", b"two");
        cache
            .load_file(&dir.path().join("a.txt"), "/a.txt", 1024)
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.find("/a.txt").unwrap().data, b"two");
    }
}
