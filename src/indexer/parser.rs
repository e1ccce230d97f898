//! Heuristic symbol and import extraction, one rule set per language

use super::language::Language;
use super::symbols::{Symbol, SymbolKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

struct SymbolRule {
    regex: Regex,
    kind: SymbolKind,
}

struct LanguageRules {
    /// Tried in order against each trimmed line; the first match wins.
    symbols: Vec<SymbolRule>,
    /// Applied to the whole source; capture group 1 is the module.
    imports: Vec<Regex>,
}

fn rules(symbols: &[(&str, SymbolKind)], imports: &[&str]) -> LanguageRules {
    LanguageRules {
        symbols: symbols
            .iter()
            .filter_map(|(pattern, kind)| {
                Regex::new(pattern).ok().map(|regex| SymbolRule { regex, kind: *kind })
            })
            .collect(),
        imports: imports.iter().filter_map(|p| Regex::new(p).ok()).collect(),
    }
}

static PYTHON: Lazy<LanguageRules> = Lazy::new(|| {
    rules(
        &[
            (r"^class\s+(\w+)", SymbolKind::Class),
            (r"^(?:async\s+)?def\s+(\w+)", SymbolKind::Function),
            (r"^([A-Z_][A-Z0-9_]*)\s*(?::[^=]+)?=", SymbolKind::Constant),
        ],
        &[r"(?m)^\s*import\s+([\w.]+)", r"(?m)^\s*from\s+([\w.]+)\s+import"],
    )
});

static ECMASCRIPT: Lazy<LanguageRules> = Lazy::new(|| {
    rules(
        &[
            (
                r"^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(\w+)",
                SymbolKind::Class,
            ),
            (r"^(?:export\s+)?interface\s+(\w+)", SymbolKind::Type),
            (r"^(?:export\s+)?type\s+(\w+)\s*(?:<[^>]*>)?\s*=", SymbolKind::Type),
            (r"^(?:export\s+)?(?:const\s+)?enum\s+(\w+)", SymbolKind::Type),
            (
                r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+(\w+)",
                SymbolKind::Function,
            ),
            (
                r"^(?:export\s+)?(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?(?:\([^)]*\)|\w+)\s*=>",
                SymbolKind::Function,
            ),
            (r"^(?:export\s+)?const\s+([A-Z_][A-Z0-9_]*)\s*=", SymbolKind::Constant),
        ],
        &[
            r#"import\s+[^'";]*?\s+from\s+['"]([^'"]+)['"]"#,
            r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
            r#"import\s+['"]([^'"]+)['"]"#,
        ],
    )
});

static GO: Lazy<LanguageRules> = Lazy::new(|| {
    rules(
        &[
            (r"^type\s+(\w+)\s+(?:struct|interface)\b", SymbolKind::Class),
            (r"^type\s+(\w+)", SymbolKind::Type),
            (r"^func\s+(?:\([^)]*\)\s*)?(\w+)", SymbolKind::Function),
            (r"^(?:const|var)\s+(\w+)", SymbolKind::Constant),
        ],
        &[r#"(?m)^\s*import\s+(?:[\w.]+\s+)?"([^"]+)""#],
    )
});

static GO_IMPORT_BLOCK: Lazy<Option<(Regex, Regex)>> = Lazy::new(|| {
    let block = Regex::new(r"(?s)import\s*\((.*?)\)").ok()?;
    let item = Regex::new(r#""([^"]+)""#).ok()?;
    Some((block, item))
});

static RUST: Lazy<LanguageRules> = Lazy::new(|| {
    rules(
        &[
            (
                r"^(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|union)\s+(\w+)",
                SymbolKind::Class,
            ),
            (r"^(?:pub(?:\([^)]*\))?\s+)?type\s+(\w+)", SymbolKind::Type),
            (
                r"^(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+(\w+)",
                SymbolKind::Function,
            ),
            (
                r"^(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(?:mut\s+)?(\w+)",
                SymbolKind::Constant,
            ),
        ],
        &[
            r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([\w:]+)",
            r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)\s*;",
        ],
    )
});

static NIM: Lazy<LanguageRules> = Lazy::new(|| {
    rules(
        &[
            (r"^type\s+(\w+)", SymbolKind::Type),
            (
                r"^(?:proc|func|method|iterator|template|macro)\s+`?(\w+)",
                SymbolKind::Function,
            ),
            (r"^const\s+(\w+)", SymbolKind::Constant),
        ],
        &[
            r"(?m)^\s*import\s+([\w/]+)",
            r"(?m)^\s*from\s+([\w/]+)\s+import",
            r"(?m)^\s*include\s+([\w/]+)",
        ],
    )
});

static RUST_IMPL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^impl(?:<[^>]*>)?\s+(?:[\w:]+(?:<[^>]*>)?\s+for\s+)?(\w+)").ok());

impl Language {
    fn rules(&self) -> &'static LanguageRules {
        match self {
            Language::Python => &PYTHON,
            Language::JavaScript | Language::TypeScript => &ECMASCRIPT,
            Language::Go => &GO,
            Language::Rust => &RUST,
            Language::Nim => &NIM,
        }
    }

    /// Declarations found by line-oriented pattern matching, in source order.
    pub fn extract_symbols(&self, source: &str) -> Vec<Symbol> {
        match self {
            Language::Python => extract_indented(source, self.rules()),
            Language::Rust => extract_rust(source, self.rules()),
            _ => extract_flat(source, self.rules()),
        }
    }

    /// Imported modules, deduplicated in first-seen order.
    pub fn extract_imports(&self, source: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();

        for regex in &self.rules().imports {
            for caps in regex.captures_iter(source) {
                if let Some(m) = caps.get(1) {
                    found.push((m.start(), m.as_str().to_string()));
                }
            }
        }

        if *self == Language::Go {
            if let Some((block, item)) = GO_IMPORT_BLOCK.as_ref() {
                for caps in block.captures_iter(source) {
                    if let Some(body) = caps.get(1) {
                        for item_caps in item.captures_iter(body.as_str()) {
                            if let Some(m) = item_caps.get(1) {
                                found.push((body.start() + m.start(), m.as_str().to_string()));
                            }
                        }
                    }
                }
            }
        }

        found.sort_by_key(|(pos, _)| *pos);
        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter_map(|(_, module)| seen.insert(module.clone()).then_some(module))
            .collect()
    }
}

fn match_line(rules: &LanguageRules, line: &str) -> Option<(String, SymbolKind)> {
    rules.symbols.iter().find_map(|rule| {
        rule.regex
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| (m.as_str().to_string(), rule.kind))
    })
}

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}

fn extract_flat(source: &str, rules: &LanguageRules) -> Vec<Symbol> {
    source
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            match_line(rules, line.trim()).map(|(name, kind)| Symbol::new(name, kind, idx + 1))
        })
        .collect()
}

/// Python: a `def` indented under a `class` is recorded with that class as container.
fn extract_indented(source: &str, rules: &LanguageRules) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    let mut current_class: Option<(String, usize)> = None;

    for (idx, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let indent = indent_of(line);
        if current_class.as_ref().is_some_and(|(_, class_indent)| indent <= *class_indent) {
            current_class = None;
        }

        let Some((name, kind)) = match_line(rules, trimmed) else {
            continue;
        };

        let container = match kind {
            SymbolKind::Function => current_class.as_ref().map(|(n, _)| n.clone()),
            _ => None,
        };
        // class-level constants inside a body are attributes, not module constants
        if kind == SymbolKind::Constant && indent > 0 {
            continue;
        }
        symbols.push(Symbol::new(name.clone(), kind, idx + 1).with_container(container));

        if kind == SymbolKind::Class {
            current_class = Some((name, indent));
        }
    }

    symbols
}

/// Rust: functions inside an `impl Type` block get `Type` as container.
fn extract_rust(source: &str, rules: &LanguageRules) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    let mut current_impl: Option<(String, i64)> = None;
    let mut depth: i64 = 0;

    for (idx, line) in source.lines().enumerate() {
        let trimmed = line.trim();

        if let Some(re) = RUST_IMPL.as_ref() {
            if let Some(caps) = re.captures(trimmed) {
                if let Some(m) = caps.get(1) {
                    current_impl = Some((m.as_str().to_string(), depth));
                }
            }
        }

        if !trimmed.starts_with("//") {
            if let Some((name, kind)) = match_line(rules, trimmed) {
                let container = match kind {
                    SymbolKind::Function => current_impl
                        .as_ref()
                        .filter(|(_, impl_depth)| depth > *impl_depth)
                        .map(|(n, _)| n.clone()),
                    _ => None,
                };
                symbols.push(Symbol::new(name, kind, idx + 1).with_container(container));
            }
        }

        for c in trimmed.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        if current_impl
            .as_ref()
            .is_some_and(|(_, impl_depth)| depth <= *impl_depth && trimmed.contains('}'))
        {
            current_impl = None;
        }
    }

    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_class_and_function_lines() {
        let source = "class Foo:\n    pass\n\n\ndef bar():\n    return 1\n";
        let symbols = Language::Python.extract_symbols(source);
        assert_eq!(
            symbols,
            vec![
                Symbol::new("Foo", SymbolKind::Class, 1),
                Symbol::new("bar", SymbolKind::Function, 5),
            ]
        );
    }

    #[test]
    fn test_python_methods_and_constants() {
        let source = "\
MAX_SIZE = 10
TIMEOUT: int = 5

class Cache:
    LIMIT = 3

    def get(self, key):
        pass

    async def load(self):
        pass

def helper():
    pass
";
        let symbols = Language::Python.extract_symbols(source);
        let summary: Vec<(&str, SymbolKind, usize, Option<&str>)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind, s.line, s.container.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("MAX_SIZE", SymbolKind::Constant, 1, None),
                ("TIMEOUT", SymbolKind::Constant, 2, None),
                ("Cache", SymbolKind::Class, 4, None),
                ("get", SymbolKind::Function, 7, Some("Cache")),
                ("load", SymbolKind::Function, 10, Some("Cache")),
                ("helper", SymbolKind::Function, 13, None),
            ]
        );
    }

    #[test]
    fn test_python_imports() {
        let source = "import os\nimport os.path\nfrom typing import List\n  import json\nimport os\n";
        assert_eq!(
            Language::Python.extract_imports(source),
            vec!["os", "os.path", "typing", "json"]
        );
    }

    #[test]
    fn test_typescript_symbols() {
        let source = "\
export class Widget {}
export interface Props {}
type Id = string;
export async function render() {}
const handler = async (e) => {};
export const MAX_ITEMS = 4;
";
        let symbols = Language::TypeScript.extract_symbols(source);
        let names: Vec<(&str, SymbolKind)> =
            symbols.iter().map(|s| (s.name.as_str(), s.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("Widget", SymbolKind::Class),
                ("Props", SymbolKind::Type),
                ("Id", SymbolKind::Type),
                ("render", SymbolKind::Function),
                ("handler", SymbolKind::Function),
                ("MAX_ITEMS", SymbolKind::Constant),
            ]
        );
    }

    #[test]
    fn test_javascript_imports() {
        let source = "\
import React from 'react';
import { useState } from \"react\";
const fs = require('fs');
import './styles.css';
";
        assert_eq!(
            Language::JavaScript.extract_imports(source),
            vec!["react", "fs", "./styles.css"]
        );
    }

    #[test]
    fn test_go_symbols_and_block_imports() {
        let source = "\
package main

import (
    \"fmt\"
    str \"strings\"
)
import \"os\"

type Server struct {}
type ID string
const Version = \"1\"
func (s *Server) Start() {}
func main() {}
";
        let symbols = Language::Go.extract_symbols(source);
        let names: Vec<(&str, SymbolKind)> =
            symbols.iter().map(|s| (s.name.as_str(), s.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("Server", SymbolKind::Class),
                ("ID", SymbolKind::Type),
                ("Version", SymbolKind::Constant),
                ("Start", SymbolKind::Function),
                ("main", SymbolKind::Function),
            ]
        );
        assert_eq!(Language::Go.extract_imports(source), vec!["fmt", "strings", "os"]);
    }

    #[test]
    fn test_rust_symbols_with_impl_container() {
        let source = "\
use std::collections::HashMap;
mod parser;

pub struct Index {
    files: HashMap<String, usize>,
}

impl Index {
    pub fn new() -> Self {
        Self { files: HashMap::new() }
    }
}

pub const LIMIT: usize = 4;
fn free() {}
";
        let symbols = Language::Rust.extract_symbols(source);
        let summary: Vec<(&str, SymbolKind, Option<&str>)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind, s.container.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Index", SymbolKind::Class, None),
                ("new", SymbolKind::Function, Some("Index")),
                ("LIMIT", SymbolKind::Constant, None),
                ("free", SymbolKind::Function, None),
            ]
        );
        assert_eq!(
            Language::Rust.extract_imports(source),
            vec!["std::collections::HashMap", "parser"]
        );
    }

    #[test]
    fn test_nim_symbols_and_imports() {
        let source = "\
import strutils, os
from times import now
include helpers

type Editor = object
const Width = 80
proc render(e: Editor) = discard
";
        let symbols = Language::Nim.extract_symbols(source);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Editor", "Width", "render"]);
        assert_eq!(
            Language::Nim.extract_imports(source),
            vec!["strutils", "times", "helpers"]
        );
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(Language::Python.extract_symbols("\u{0}\u{1}%%%").is_empty());
        assert!(Language::Rust.extract_imports("").is_empty());
    }
}
