//! Static-asset file server: content-addressed in-memory store with a
//! binary on-disk snapshot, filesystem fallback, exclusion globs,
//! auto-reload and MIME classification.

pub mod cache;
pub mod mime;
pub mod snapshot;

use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, error, info, warn};

use crate::error::MinuetResult;
use crate::http::{Response, ResponseState};
use cache::FileCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileServerMode {
    /// Open and stream from disk on every request.
    Filesystem,
    /// Serve from the in-memory cache or 404.
    Memory,
    /// Cache first, filesystem fallback.
    Hybrid,
}

#[derive(Clone)]
pub struct FileServerConfig {
    /// Directory containing the static files.
    pub static_dir: PathBuf,
    /// Path of the binary snapshot file.
    pub cache_file: PathBuf,
    /// URL prefix under which assets are addressable, e.g. `/assets/`.
    pub url_prefix: String,
    pub mode: FileServerMode,
    /// Compare on-disk mtimes on every cache hit and reload changed files.
    pub auto_reload: bool,
    /// Largest cacheable file in bytes.
    pub max_file_size: usize,
    /// Glob patterns over logical paths; a trailing `/` also matches any
    /// descendant.
    pub exclude_patterns: Vec<String>,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        FileServerConfig {
            static_dir: PathBuf::from("./assets"),
            cache_file: PathBuf::from("./build/static_cache.bin"),
            url_prefix: "/assets/".to_string(),
            mode: FileServerMode::Hybrid,
            auto_reload: false,
            max_file_size: 10 * 1024 * 1024,
            exclude_patterns: Vec::new(),
        }
    }
}

pub struct FileServer {
    config: FileServerConfig,
    patterns: Vec<Pattern>,
    cache: FileCache,
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    // Path-separator awareness: `*` must not cross `/`.
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(target: "fileserver", pattern = %p, "invalid exclude pattern: {e}");
                None
            }
        })
        .collect()
}

impl FileServer {
    /// Load the snapshot when present, otherwise scan the asset directory
    /// and write a fresh snapshot.
    pub fn init(config: FileServerConfig) -> MinuetResult<Self> {
        let patterns = compile_patterns(&config.exclude_patterns);
        let mut server = FileServer {
            patterns,
            cache: FileCache::new(),
            config,
        };

        if server.config.mode != FileServerMode::Filesystem {
            if server.config.cache_file.is_file() {
                match snapshot::load(&server.config.cache_file, server.config.max_file_size) {
                    Ok(cache) => server.cache = cache,
                    Err(e) => {
                        error!(target: "fileserver", "snapshot load failed: {e}, rebuilding");
                        server.build_cache()?;
                    }
                }
            } else {
                server.build_cache()?;
            }
        }

        info!(
            target: "fileserver",
            mode = ?server.config.mode,
            files = server.cache.len(),
            "file server initialized"
        );
        Ok(server)
    }

    /// Scan the asset directory into the cache and persist the snapshot.
    pub fn build_cache(&mut self) -> MinuetResult<()> {
        self.cache.clear();
        let base = self.config.static_dir.clone();
        let patterns = std::mem::take(&mut self.patterns);
        let max = self.config.max_file_size;
        let excluded = |rel: &str| is_excluded(&patterns, &self.config.exclude_patterns, rel);
        let result = self.cache.scan_directory(&base, &base, max, &excluded);
        self.patterns = patterns;
        result?;
        self.save_cache()
    }

    pub fn save_cache(&self) -> MinuetResult<()> {
        snapshot::save(&self.cache, &self.config.cache_file)
    }

    pub fn load_cache(&mut self) -> MinuetResult<()> {
        self.cache = snapshot::load(&self.config.cache_file, self.config.max_file_size)?;
        Ok(())
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached_file_count(&self) -> usize {
        self.cache.len()
    }

    /// Register one more exclusion pattern at runtime.
    pub fn add_exclude(&mut self, pattern: &str) {
        if pattern.is_empty() {
            return;
        }
        self.config.exclude_patterns.push(pattern.to_string());
        if let Ok(compiled) = Pattern::new(pattern) {
            self.patterns.push(compiled);
        }
    }

    /// A URL is statically servable when it sits under the configured prefix
    /// and carries a known extension.
    pub fn is_static_url(&self, path: &str) -> bool {
        path.starts_with(&self.config.url_prefix) && mime::has_known_extension(path)
    }

    /// Whether this request belongs to the file server. Traversal attempts
    /// under the asset prefix are claimed too, so they are answered with
    /// 403 instead of falling through to the 404 page.
    pub fn handles_url(&self, path: &str) -> bool {
        if !path.starts_with(&self.config.url_prefix) {
            return false;
        }
        mime::has_known_extension(path) || path.contains("..") || path.contains("//")
    }

    /// Strip the URL prefix so `/assets/foo.css` addresses `/foo.css`.
    fn normalize(&self, url_path: &str) -> String {
        match url_path.strip_prefix(&self.config.url_prefix) {
            Some(rest) => format!("/{rest}"),
            None => url_path.to_string(),
        }
    }

    /// Populate `res` for a static request; the traversal guard and all
    /// three serving modes funnel through here.
    pub fn handle_request(&mut self, url_path: &str, res: &mut Response) {
        // Path traversal is rejected before any lookup.
        if url_path.contains("..") || url_path.contains("//") {
            res.status = 403;
            res.set_static_body(b"Forbidden");
            res.state = ResponseState::Processed;
            return;
        }

        let logical = self.normalize(url_path);
        debug!(target: "fileserver", url_path, logical = %logical, "static lookup");

        let served = match self.config.mode {
            FileServerMode::Memory => self.serve_from_memory(&logical, res),
            FileServerMode::Filesystem => {
                let full = self.full_path(&logical);
                self.serve_from_filesystem(&full, res)
            }
            FileServerMode::Hybrid => {
                self.serve_from_memory(&logical, res) || {
                    let full = self.full_path(&logical);
                    self.serve_from_filesystem(&full, res)
                }
            }
        };

        if !served {
            res.status = 404;
            res.set_static_body(b"File not found");
            res.state = ResponseState::Processed;
        }
    }

    fn full_path(&self, logical: &str) -> PathBuf {
        let rel = logical.strip_prefix('/').unwrap_or(logical);
        self.config.static_dir.join(rel)
    }

    pub fn serve_from_memory(&mut self, logical: &str, res: &mut Response) -> bool {
        if self.config.auto_reload {
            self.reload_if_modified(logical);
        }

        let Some(cached) = self.cache.find(logical) else {
            debug!(target: "fileserver", logical = %logical, "cache miss");
            return false;
        };

        res.status = 200;
        res.priority = mime::resource_priority(logical);
        let mime_type = cached.mime_type.clone();
        res.add_header("Content-Type", &mime_type);
        res.add_header("Cache-Control", "public, max-age=31536000");
        res.set_body(cached.data.clone());
        res.state = ResponseState::Processed;
        debug!(target: "fileserver", logical = %logical, bytes = res.body.len(), "served from memory");
        true
    }

    pub fn serve_from_filesystem(&self, full_path: &Path, res: &mut Response) -> bool {
        let Ok(data) = fs::read(full_path) else {
            return false;
        };

        let name = full_path.to_string_lossy();
        res.status = 200;
        res.priority = mime::resource_priority(&name);
        res.add_header("Content-Type", mime::mime_type(&name));
        res.add_header("Cache-Control", "public, max-age=31536000");
        res.set_body(data);
        res.state = ResponseState::Processed;
        debug!(target: "fileserver", path = %full_path.display(), bytes = res.body.len(), "served from filesystem");
        true
    }

    /// Auto-reload: when the on-disk file is newer than the cache entry,
    /// reload it and rewrite the snapshot.
    fn reload_if_modified(&mut self, logical: &str) {
        let Some(cached_mtime) = self.cache.find(logical).map(|f| f.last_modified) else {
            return;
        };
        let full = self.full_path(logical);
        let on_disk = match cache::mtime_secs(&full) {
            Ok(mtime) => mtime,
            Err(_) => return,
        };
        if on_disk <= cached_mtime {
            return;
        }

        debug!(target: "fileserver", logical = %logical, "file modified, reloading");
        match self
            .cache
            .load_file(&full, logical, self.config.max_file_size)
        {
            Ok(true) => {
                if let Err(e) = self.save_cache() {
                    warn!(target: "fileserver", "snapshot rewrite failed: {e}");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(target: "fileserver", logical = %logical, "reload failed: {e}"),
        }
    }
}

/// Glob semantics over logical paths plus the trailing-`/` directory rule.
fn is_excluded(patterns: &[Pattern], raw: &[String], rel_path: &str) -> bool {
    for pattern in patterns {
        if pattern.matches_with(rel_path, GLOB_OPTIONS) {
            return true;
        }
    }
    for raw_pattern in raw {
        if raw_pattern.ends_with('/') && rel_path.starts_with(raw_pattern.as_str()) {
            return true;
        }
    }
    false
}
