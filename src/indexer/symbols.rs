//! Symbol table types

use super::language::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    Constant,
    Type,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::Constant => "constant",
            SymbolKind::Type => "type",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based
    pub line: usize,
    /// Enclosing class or type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, line: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            line,
            container: None,
            end_line: None,
        }
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }

    pub fn contains_line(&self, line: usize) -> bool {
        line >= self.line && line <= self.end_line.unwrap_or(self.line)
    }
}

/// A symbol tagged with the project-relative file it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolLocation {
    pub path: String,
    pub line: usize,
    pub symbol: Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub language: Language,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub symbol_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlineNode {
    pub symbol: Symbol,
    pub children: Vec<OutlineNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentOutline {
    pub path: String,
    pub nodes: Vec<OutlineNode>,
    pub classes: usize,
    pub functions: usize,
    pub constants: usize,
    pub types: usize,
}

impl DocumentOutline {
    /// Nest symbols under the top-level symbol named by their container.
    pub fn build(path: &str, symbols: &[Symbol]) -> Self {
        let mut outline = DocumentOutline {
            path: path.to_string(),
            ..Default::default()
        };

        for symbol in symbols {
            match symbol.kind {
                SymbolKind::Class => outline.classes += 1,
                SymbolKind::Function => outline.functions += 1,
                SymbolKind::Constant => outline.constants += 1,
                SymbolKind::Type => outline.types += 1,
            }
        }

        for symbol in symbols.iter().filter(|s| s.container.is_none()) {
            outline.nodes.push(OutlineNode {
                symbol: symbol.clone(),
                children: Vec::new(),
            });
        }

        for symbol in symbols.iter().filter(|s| s.container.is_some()) {
            let parent = outline
                .nodes
                .iter_mut()
                .find(|n| Some(&n.symbol.name) == symbol.container.as_ref());
            let node = OutlineNode {
                symbol: symbol.clone(),
                children: Vec::new(),
            };
            match parent {
                Some(parent) => parent.children.push(node),
                None => outline.nodes.push(node),
            }
        }

        outline.nodes.sort_by_key(|n| n.symbol.line);
        outline
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&format!(
                "{} {} (line {})\n",
                node.symbol.kind, node.symbol.name, node.symbol.line
            ));
            for child in &node.children {
                out.push_str(&format!(
                    "  {} {} (line {})\n",
                    child.symbol.kind, child.symbol.name, child.symbol.line
                ));
            }
        }
        out
    }
}
