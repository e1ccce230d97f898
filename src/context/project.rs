//! Project overview: a shallow file tree and the README head

use serde::Serialize;
use std::path::Path;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

const TREE_IGNORED: &[&str] = &[".git", ".codectx", "__pycache__", "node_modules", ".vscode"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectOverview {
    pub file_structure: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme_summary: Option<String>,
}

impl ProjectOverview {
    pub fn collect(root: &Path, depth: usize, readme_lines: usize) -> Self {
        Self {
            file_structure: file_tree(root, depth),
            readme_summary: readme_summary(root, readme_lines),
        }
    }
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| TREE_IGNORED.contains(&name))
}

/// One `├── name` line per entry, indented two spaces per level; directories end in `/`.
pub fn file_tree(root: &Path, max_depth: usize) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(|e| e.ok())
        .map(|entry| {
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                format!("{}├── {}/", indent, name)
            } else {
                format!("{}├── {}", indent, name)
            }
        })
        .collect()
}

/// First `lines` lines of the first `README*` file at the root.
pub fn readme_summary(root: &Path, lines: usize) -> Option<String> {
    let pattern = root.join("README*");
    let readme = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(|p| p.ok())
        .find(|p| p.is_file())?;

    match std::fs::read_to_string(&readme) {
        Ok(content) => Some(content.lines().take(lines).collect::<Vec<_>>().join("\n")),
        Err(e) => {
            warn!(path = %readme.display(), error = %e, "could not read README");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_tree_is_sorted_and_depth_limited() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/core/deep/deeper")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("src/main.py"), "").unwrap();
        fs::write(root.join("src/core/deep/hidden.py"), "").unwrap();
        fs::write(root.join("setup.py"), "").unwrap();

        assert_eq!(
            file_tree(root, 3),
            vec![
                "├── setup.py",
                "├── src/",
                "  ├── core/",
                "    ├── deep/",
                "  ├── main.py",
            ]
        );
    }

    #[test]
    fn test_readme_head() {
        let dir = TempDir::new().unwrap();
        let body: Vec<String> = (1..=20).map(|i| format!("line {}", i)).collect();
        fs::write(dir.path().join("README.md"), body.join("\n")).unwrap();

        let summary = readme_summary(dir.path(), 15).unwrap();
        assert_eq!(summary.lines().count(), 15);
        assert!(summary.ends_with("line 15"));
    }

    #[test]
    fn test_missing_readme() {
        let dir = TempDir::new().unwrap();
        assert!(readme_summary(dir.path(), 15).is_none());
        let overview = ProjectOverview::collect(dir.path(), 3, 15);
        assert!(overview.file_structure.is_empty());
    }
}
