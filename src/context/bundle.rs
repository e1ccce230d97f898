//! The assembled context handed to a model

use super::project::ProjectOverview;
use crate::indexer::{Diagnostic, DocumentOutline, FileMetadata, Language, Symbol, SymbolLocation};
use crate::memory::SearchResult;
use serde::Serialize;

/// Characters of each search hit shown by `format_for_llm`.
const HIT_PREVIEW_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CursorPosition {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub query: String,
    pub project_root: String,
    pub language: Language,
    pub current_file: Option<String>,
    pub selected_code: Option<String>,
    pub cursor_position: Option<CursorPosition>,
    pub dependencies: Vec<String>,
    pub symbols: Vec<Symbol>,
    /// Symbols whose span covers the cursor line, outermost first.
    pub cursor_symbols: Vec<Symbol>,
    /// Language server diagnostics for the current file.
    pub diagnostics: Vec<Diagnostic>,
    pub recent_changes: usize,
    pub outline: Option<DocumentOutline>,
    pub file_metadata: Option<FileMetadata>,
    pub project_overview: ProjectOverview,
    /// Top-level project symbols, only for general queries.
    pub project_symbols: Vec<SymbolLocation>,
    pub semantic_context: Vec<SearchResult>,
    pub relevant_history: Vec<SearchResult>,
    pub similar_patterns: Vec<SearchResult>,
}

impl ContextBundle {
    /// Render as markdown sections; empty sections are left out.
    pub fn format_for_llm(&self) -> String {
        let mut out = String::new();

        out.push_str("# Project Context\n\n");
        out.push_str(&format!("- Root: {}\n", self.project_root));
        out.push_str(&format!("- Language: {}\n", self.language));
        if let Some(file) = &self.current_file {
            out.push_str(&format!("- Current file: {}\n", file));
        }
        if let Some(cursor) = &self.cursor_position {
            out.push_str(&format!("- Cursor: line {}, column {}\n", cursor.line, cursor.column));
        }
        if self.recent_changes > 0 {
            out.push_str(&format!("- Recent changes: {}\n", self.recent_changes));
        }
        out.push('\n');

        if let Some(selection) = &self.selected_code {
            out.push_str("## Selected Code\n\n```\n");
            out.push_str(selection.trim_end());
            out.push_str("\n```\n\n");
        }

        if !self.cursor_symbols.is_empty() {
            let path: Vec<&str> = self.cursor_symbols.iter().map(|s| s.name.as_str()).collect();
            out.push_str(&format!("## At Cursor\n\n{}\n\n", path.join(" > ")));
        }

        if !self.diagnostics.is_empty() {
            out.push_str("## Diagnostics\n\n");
            for d in &self.diagnostics {
                let source = d.source.as_deref().map(|s| format!(" ({})", s)).unwrap_or_default();
                out.push_str(&format!("- {} [line {}] {}{}\n", d.severity, d.line, d.message, source));
            }
            out.push('\n');
        }

        if let Some(outline) = self.outline.as_ref().filter(|o| !o.nodes.is_empty()) {
            out.push_str(&format!(
                "## Outline: {} ({} classes, {} functions, {} constants, {} types)\n\n",
                outline.path, outline.classes, outline.functions, outline.constants, outline.types
            ));
            out.push_str(&outline.render());
            out.push('\n');
        }

        if !self.dependencies.is_empty() {
            out.push_str("## Dependencies\n\n");
            for dep in &self.dependencies {
                out.push_str(&format!("- {}\n", dep));
            }
            out.push('\n');
        }

        if !self.project_symbols.is_empty() {
            out.push_str("## Project Symbols\n\n");
            for loc in &self.project_symbols {
                out.push_str(&format!(
                    "- {} {} ({}:{})\n",
                    loc.symbol.kind, loc.symbol.name, loc.path, loc.line
                ));
            }
            out.push('\n');
        }

        push_hits(&mut out, "Semantic Matches", &self.semantic_context);
        push_hits(&mut out, "Relevant History", &self.relevant_history);
        push_hits(&mut out, "Similar Code", &self.similar_patterns);

        if !self.project_overview.file_structure.is_empty() {
            out.push_str("## File Structure\n\n");
            for line in &self.project_overview.file_structure {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }

        if let Some(readme) = &self.project_overview.readme_summary {
            out.push_str("## README\n\n");
            out.push_str(readme);
            out.push_str("\n\n");
        }

        out.push_str(&format!("## Query\n\n{}\n", self.query));
        out
    }
}

fn push_hits(out: &mut String, title: &str, hits: &[SearchResult]) {
    if hits.is_empty() {
        return;
    }
    out.push_str(&format!("## {}\n\n", title));
    for hit in hits {
        let location = hit
            .file_path
            .as_deref()
            .map(|p| format!(" {}", p))
            .unwrap_or_default();
        out.push_str(&format!(
            "- [{}{}] (similarity {:.2}) {}\n",
            hit.kind,
            location,
            hit.similarity,
            hit.summary(HIT_PREVIEW_CHARS)
        ));
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::SymbolKind;

    fn bundle() -> ContextBundle {
        ContextBundle {
            query: "how is parsing done".into(),
            project_root: "/work/demo".into(),
            language: Language::Python,
            current_file: Some("app.py".into()),
            selected_code: Some("def parse(text):\n    return text\n".into()),
            cursor_position: Some(CursorPosition { line: 4, column: 2 }),
            dependencies: vec!["os".into()],
            symbols: vec![Symbol::new("parse", SymbolKind::Function, 1)],
            cursor_symbols: Vec::new(),
            diagnostics: Vec::new(),
            recent_changes: 2,
            outline: Some(DocumentOutline::build(
                "app.py",
                &[Symbol::new("parse", SymbolKind::Function, 1)],
            )),
            file_metadata: None,
            project_overview: ProjectOverview {
                file_structure: vec!["├── app.py".into()],
                readme_summary: Some("# Demo".into()),
            },
            project_symbols: Vec::new(),
            semantic_context: Vec::new(),
            relevant_history: Vec::new(),
            similar_patterns: Vec::new(),
        }
    }

    #[test]
    fn test_format_includes_populated_sections() {
        let text = bundle().format_for_llm();
        assert!(text.starts_with("# Project Context"));
        assert!(text.contains("- Current file: app.py"));
        assert!(text.contains("- Cursor: line 4, column 2"));
        assert!(text.contains("## Selected Code\n\n```\ndef parse(text):"));
        assert!(text.contains("## Outline: app.py (0 classes, 1 functions"));
        assert!(text.contains("## Dependencies\n\n- os"));
        assert!(text.contains("├── app.py"));
        assert!(text.contains("## README\n\n# Demo"));
        assert!(text.trim_end().ends_with("how is parsing done"));
    }

    #[test]
    fn test_format_skips_empty_sections() {
        let mut b = bundle();
        b.selected_code = None;
        b.dependencies.clear();
        let text = b.format_for_llm();
        assert!(!text.contains("## Selected Code"));
        assert!(!text.contains("## Dependencies"));
        assert!(!text.contains("## Semantic Matches"));
        assert!(!text.contains("## Diagnostics"));
        assert!(!text.contains("## At Cursor"));
    }

    #[test]
    fn test_format_cursor_symbols_and_diagnostics() {
        let mut b = bundle();
        b.cursor_symbols = vec![
            Symbol::new("Parser", SymbolKind::Class, 1),
            Symbol::new("parse", SymbolKind::Function, 3),
        ];
        b.diagnostics = vec![
            Diagnostic {
                line: 4,
                severity: "ERROR",
                message: "undefined name 'txt'".into(),
                source: Some("pyflakes".into()),
            },
            Diagnostic {
                line: 7,
                severity: "HINT",
                message: "unused variable".into(),
                source: None,
            },
        ];

        let text = b.format_for_llm();
        assert!(text.contains("## At Cursor\n\nParser > parse\n"));
        assert!(text.contains("- ERROR [line 4] undefined name 'txt' (pyflakes)\n"));
        assert!(text.contains("- HINT [line 7] unused variable\n"));
    }
}
