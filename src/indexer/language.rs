//! Supported languages and project language detection

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Languages with a heuristic parser. Declaration order breaks detection ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Go,
    Rust,
    Nim,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Go,
        Language::Rust,
        Language::Nim,
    ];

    pub fn from_extension(ext: &str) -> Option<Language> {
        match ext.to_lowercase().as_str() {
            "py" | "pyw" | "pyi" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "ts" | "tsx" | "mts" | "cts" => Some(Language::TypeScript),
            "go" => Some(Language::Go),
            "rs" => Some(Language::Rust),
            "nim" | "nims" => Some(Language::Nim),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Language> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Language::from_extension)
    }

    /// Lowercase name, also the key for language server commands in config.
    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Nim => "nim",
        }
    }

    /// LSP `languageId` for `textDocument/didOpen`.
    pub fn language_id(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            other => other.name(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dominant language by file count; ties go to the earlier declared language.
///
/// A project without any supported file is treated as Python.
pub fn detect_dominant<'a, I>(paths: I) -> Language
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut census: HashMap<Language, usize> = HashMap::new();
    for path in paths {
        if let Some(lang) = Language::from_path(path) {
            *census.entry(lang).or_insert(0) += 1;
        }
    }

    Language::ALL
        .iter()
        .copied()
        .max_by(|a, b| {
            let ca = census.get(a).copied().unwrap_or(0);
            let cb = census.get(b).copied().unwrap_or(0);
            // reversed declaration order so the earlier language wins a tie
            ca.cmp(&cb).then_with(|| b.cmp(a))
        })
        .filter(|lang| census.contains_key(lang))
        .unwrap_or(Language::Python)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(Language::from_extension("py"), Some(Language::Python));
        assert_eq!(Language::from_extension("TSX"), Some(Language::TypeScript));
        assert_eq!(Language::from_extension("nim"), Some(Language::Nim));
        assert_eq!(Language::from_extension("md"), None);
    }

    #[test]
    fn test_detect_dominant_by_count() {
        let files = paths(&["a.rs", "b.rs", "c.py", "README.md"]);
        assert_eq!(detect_dominant(files.iter().map(|p| p.as_path())), Language::Rust);
    }

    #[test]
    fn test_detect_tie_prefers_declaration_order() {
        let files = paths(&["main.go", "lib.rs", "x.nim", "y.go", "z.rs"]);
        assert_eq!(detect_dominant(files.iter().map(|p| p.as_path())), Language::Go);
    }

    #[test]
    fn test_detect_empty_project_defaults_to_python() {
        let files = paths(&["notes.txt"]);
        assert_eq!(detect_dominant(files.iter().map(|p| p.as_path())), Language::Python);
    }
}
