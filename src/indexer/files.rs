//! Project file discovery

use super::language::Language;
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Directories never descended into.
pub const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".codectx",
    ".idea",
    ".vscode",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "site-packages",
    "dist",
    "build",
    "target",
    "vendor",
    "nimcache",
    ".next",
    ".nuxt",
];

pub struct FileWalker {
    root: PathBuf,
    exclude: Vec<Pattern>,
    max_files: usize,
}

impl FileWalker {
    pub fn new(root: &Path, exclude: &[String], max_files: usize) -> Self {
        let exclude = exclude
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            exclude,
            max_files,
        }
    }

    fn is_skipped_dir(entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIPPED_DIRS.contains(&name))
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.exclude
            .iter()
            .any(|p| p.matches_path(relative) || p.matches_path(path))
    }

    /// Supported source files in path order, capped at `max_files`.
    pub fn source_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !Self::is_skipped_dir(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(DirEntry::into_path)
            .filter(|p| Language::from_path(p).is_some())
            .filter(|p| !self.is_excluded(p))
            .take(self.max_files)
            .collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_skips_vendor_dirs_and_unsupported_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/app.py");
        touch(dir.path(), "src/util.ts");
        touch(dir.path(), "node_modules/lib/index.js");
        touch(dir.path(), ".git/hooks/pre-commit.py");
        touch(dir.path(), "target/debug/build.rs");
        touch(dir.path(), "README.md");

        let walker = FileWalker::new(dir.path(), &[], 100);
        let files = walker.source_files();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["src/app.py", "src/util.ts"]);
    }

    #[test]
    fn test_exclude_patterns_and_cap() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");
        touch(dir.path(), "b.py");
        touch(dir.path(), "gen/c_pb2.py");

        let walker = FileWalker::new(dir.path(), &["gen/**".to_string(), "[".to_string()], 100);
        assert_eq!(walker.source_files().len(), 2);

        let capped = FileWalker::new(dir.path(), &[], 1);
        assert_eq!(capped.source_files().len(), 1);
    }
}
