//! Local filesystem input discovery.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::normalize::ALIGNED_MARKER;

use super::InputEntry;

/// Options for scanning an input directory.
#[derive(Debug, Clone)]
pub struct LocalScanOptions {
    /// Minimum directory depth to scan (1 = files directly in the root)
    pub min_depth: usize,
    /// Maximum directory depth to scan (None = unlimited)
    pub max_depth: Option<usize>,
    /// File extensions to accept (case-insensitive, without the dot)
    pub extensions: Vec<String>,
    /// Whether to follow symbolic links
    pub follow_links: bool,
    /// Skip files whose name contains this marker
    pub exclude_marker: Option<String>,
}

impl Default for LocalScanOptions {
    fn default() -> Self {
        Self {
            min_depth: 1,
            max_depth: Some(1),
            extensions: vec!["tif".to_string()],
            follow_links: false,
            exclude_marker: Some(ALIGNED_MARKER.to_string()),
        }
    }
}

impl LocalScanOptions {
    /// Non-recursive scan for a single extension
    #[must_use]
    pub fn with_extension(extension: &str) -> Self {
        Self {
            extensions: vec![extension.trim_start_matches('.').to_string()],
            ..Default::default()
        }
    }

    /// Scan all subdirectories as well
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.max_depth = None;
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        let ext_ok = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        let excluded = self.exclude_marker.as_deref().is_some_and(|marker| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().contains(marker))
        });
        ext_ok && !excluded
    }
}

/// Input files found under a local directory, sorted by path.
#[derive(Debug, Clone)]
pub struct LocalInputSource {
    entries: Vec<InputEntry>,
}

impl LocalInputSource {
    /// Scan a directory for input rasters.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the root directory does not exist.
    pub fn scan<P: AsRef<Path>>(root: P, options: &LocalScanOptions) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "input directory does not exist: {}",
                root.display()
            )));
        }

        let mut walker = WalkDir::new(root)
            .min_depth(options.min_depth)
            .follow_links(options.follow_links);
        if let Some(max) = options.max_depth {
            walker = walker.max_depth(max);
        }

        let mut entries = Vec::new();
        for entry in walker.into_iter().filter_map(std::result::Result::ok) {
            let path = entry.path();
            if !entry.file_type().is_file() || !options.accepts(path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read file metadata");
                    continue;
                }
            };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            debug!(path = %path.display(), "Discovered input");
            entries.push(InputEntry {
                name,
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Self { entries })
    }

    #[must_use]
    pub fn entries(&self) -> &[InputEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics about discovered inputs.
    #[must_use]
    pub fn stats(&self) -> LocalSourceStats {
        LocalSourceStats {
            file_count: self.entries.len(),
            total_size_bytes: self.entries.iter().map(|e| e.size_bytes).sum(),
        }
    }
}

/// Statistics about a local input scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSourceStats {
    pub file_count: usize,
    pub total_size_bytes: u64,
}

impl LocalSourceStats {
    /// Get total size in megabytes
    #[must_use]
    pub fn total_size_mb(&self) -> f64 {
        // Allow cast precision loss: file sizes in MB don't need exact precision
        #[allow(clippy::cast_precision_loss)]
        { self.total_size_bytes as f64 / 1024.0 / 1024.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, len: usize) {
        fs::write(dir.join(name), vec![0u8; len]).unwrap();
    }

    #[test]
    fn test_default_options() {
        let opts = LocalScanOptions::default();
        assert_eq!(opts.max_depth, Some(1));
        assert_eq!(opts.extensions, vec!["tif".to_string()]);
        assert_eq!(opts.exclude_marker.as_deref(), Some("_aligned"));
    }

    #[test]
    fn test_scan_filters_sorts_and_excludes_derivatives() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.tif", 10);
        touch(dir.path(), "a.TIF", 20);
        touch(dir.path(), "a_aligned.tif", 5);
        touch(dir.path(), "notes.txt", 5);
        fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "c.tif", 5);

        let source = LocalInputSource::scan(dir.path(), &LocalScanOptions::default()).unwrap();
        let names: Vec<_> = source.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let first = &source.entries()[0];
        assert_eq!(first.path, dir.path().join("a.TIF"));
        assert_eq!(first.size_bytes, 20);

        let stats = source.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_size_bytes, 30);
    }

    #[test]
    fn test_recursive_scan() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "c.jp2", 5);
        let source = LocalInputSource::scan(dir.path(), &LocalScanOptions::with_extension(".jp2").recursive()).unwrap();
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn test_scan_empty_dir() {
        let dir = TempDir::new().unwrap();
        let source = LocalInputSource::scan(dir.path(), &LocalScanOptions::default()).unwrap();
        assert!(source.is_empty());
    }

    #[test]
    fn test_scan_nonexistent_dir() {
        let result = LocalInputSource::scan("/nonexistent/path", &LocalScanOptions::default());
        assert!(result.is_err());
    }
}
