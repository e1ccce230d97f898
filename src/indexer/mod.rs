//! Project symbol index.
//!
//! Every supported file is parsed with its language's heuristic rules. When a
//! language server is configured for the file's language and answers in time
//! its document symbols win. Each language gets its own server: the dominant
//! language's starts with the index, the others on their first file. A server
//! that keeps failing is dropped and its language stays on the heuristics.

pub mod files;
pub mod language;
pub mod lsp;
pub mod parser;
pub mod symbols;

pub use language::{Language, detect_dominant};
pub use lsp::Diagnostic;
pub use symbols::{DocumentOutline, FileMetadata, OutlineNode, Symbol, SymbolKind, SymbolLocation};

use crate::config::IndexerConfig;
use crate::error::{CodectxError, Result};
use chrono::{DateTime, Utc};
use files::FileWalker;
use lsp::LspSession;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive server failures tolerated before falling back for good.
const MAX_SERVER_FAILURES: u32 = 3;

struct ServerHandle {
    session: LspSession,
    failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Uninitialized,
    LanguageDetected,
    ServerStarted,
    FallbackOnly,
    Indexed,
}

#[derive(Debug, Clone)]
struct IndexedFile {
    symbols: Vec<Symbol>,
    imports: Vec<String>,
    metadata: FileMetadata,
}

pub struct SymbolIndexer {
    config: IndexerConfig,
    root: PathBuf,
    state: IndexerState,
    language: Language,
    servers: HashMap<Language, ServerHandle>,
    /// Languages whose server was already started or given up on.
    attempted: HashSet<Language>,
    /// Keyed by `/`-separated path relative to the root, so iteration is path order.
    files: BTreeMap<String, IndexedFile>,
}

impl SymbolIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            root: PathBuf::new(),
            state: IndexerState::Uninitialized,
            language: Language::Python,
            servers: HashMap::new(),
            attempted: HashSet::new(),
            files: BTreeMap::new(),
        }
    }

    pub async fn initialize(&mut self, root: &Path) -> Result<()> {
        self.root = root.to_path_buf();
        let walker = self.walker();
        let paths = walker.source_files();

        self.language = detect_dominant(paths.iter().map(PathBuf::as_path));
        self.state = IndexerState::LanguageDetected;
        info!(language = %self.language, files = paths.len(), "detected project language");

        self.state = if self.ensure_server(self.language).await {
            IndexerState::ServerStarted
        } else {
            IndexerState::FallbackOnly
        };
        self.rebuild(paths).await;
        Ok(())
    }

    /// Whether a server for `language` is running, starting it on first demand.
    async fn ensure_server(&mut self, language: Language) -> bool {
        if self.servers.contains_key(&language) {
            return true;
        }
        if !self.attempted.insert(language) || !self.config.use_language_server {
            return false;
        }
        let Some(command) = self.config.servers.get(language.name()).cloned() else {
            debug!(language = %language, "no language server configured");
            return false;
        };

        match LspSession::start(
            &command,
            &self.root,
            Duration::from_millis(self.config.handshake_timeout_ms),
            Duration::from_millis(self.config.request_timeout_ms),
        )
        .await
        {
            Ok(session) => {
                self.servers.insert(language, ServerHandle { session, failures: 0 });
                true
            }
            Err(e) => {
                warn!(error = %e, language = %language, "language server unavailable, using heuristic parser");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn attach_server(&mut self, language: Language, session: LspSession) {
        self.attempted.insert(language);
        self.servers.insert(language, ServerHandle { session, failures: 0 });
    }

    fn walker(&self) -> FileWalker {
        FileWalker::new(&self.root, &self.config.exclude, self.config.max_files)
    }

    async fn rebuild(&mut self, paths: Vec<PathBuf>) {
        self.files.clear();
        for path in paths {
            self.index_file(&path).await;
        }
        self.state = IndexerState::Indexed;
        info!(files = self.files.len(), "index built");
    }

    /// Project-relative key for a path given either absolute or relative to the root.
    fn key_for(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative.to_string_lossy().replace('\\', "/")
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn index_file(&mut self, path: &Path) {
        let Some(language) = Language::from_path(path) else {
            return;
        };
        let absolute = self.absolute(path);
        let key = self.key_for(&absolute);

        let (size_bytes, modified) = match tokio::fs::metadata(&absolute).await {
            Ok(meta) => (
                meta.len(),
                meta.modified().ok().map(DateTime::<Utc>::from),
            ),
            Err(_) => (0, None),
        };

        let (symbols, imports) = match tokio::fs::read_to_string(&absolute).await {
            Ok(source) => {
                let mut symbols = language.extract_symbols(&source);
                if let Some(server_symbols) = self.server_symbols(&absolute, language, &source).await {
                    symbols = server_symbols;
                }
                (symbols, language.extract_imports(&source))
            }
            Err(e) => {
                debug!(path = %key, error = %e, "unreadable file indexed as empty");
                (Vec::new(), Vec::new())
            }
        };

        let metadata = FileMetadata {
            language,
            size_bytes,
            modified,
            symbol_count: symbols.len(),
        };
        self.files.insert(
            key,
            IndexedFile {
                symbols,
                imports,
                metadata,
            },
        );
    }

    /// Non-empty server symbols, or `None` to keep the heuristic result.
    async fn server_symbols(&mut self, path: &Path, language: Language, source: &str) -> Option<Vec<Symbol>> {
        if !self.ensure_server(language).await {
            return None;
        }
        let handle = self.servers.get_mut(&language)?;
        match handle.session.document_symbols(path, language, source).await {
            Ok(symbols) => {
                handle.failures = 0;
                (!symbols.is_empty()).then_some(symbols)
            }
            Err(e) => {
                handle.failures += 1;
                debug!(path = %path.display(), error = %e, failures = handle.failures, "documentSymbol failed");
                if handle.failures >= MAX_SERVER_FAILURES {
                    warn!(
                        server = %handle.session.server_name(),
                        language = %language,
                        "language server keeps failing, switching to heuristic parser"
                    );
                    self.stop_server(language).await;
                }
                None
            }
        }
    }

    async fn stop_server(&mut self, language: Language) {
        if let Some(handle) = self.servers.remove(&language) {
            handle.session.shutdown().await;
        }
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Languages with a running server.
    pub fn server_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.servers.keys().copied().collect();
        languages.sort();
        languages
    }

    pub fn get_symbols(&self, path: &Path) -> Vec<Symbol> {
        self.files
            .get(&self.key_for(path))
            .map(|f| f.symbols.clone())
            .unwrap_or_default()
    }

    pub fn get_dependencies(&self, path: &Path) -> Vec<String> {
        self.files
            .get(&self.key_for(path))
            .map(|f| f.imports.clone())
            .unwrap_or_default()
    }

    pub fn get_project_symbols(&self) -> Vec<SymbolLocation> {
        self.files
            .iter()
            .flat_map(|(path, file)| {
                file.symbols.iter().map(move |symbol| SymbolLocation {
                    path: path.clone(),
                    line: symbol.line,
                    symbol: symbol.clone(),
                })
            })
            .collect()
    }

    pub fn find_symbol_references(&self, name: &str) -> Vec<SymbolLocation> {
        self.get_project_symbols()
            .into_iter()
            .filter(|loc| loc.symbol.name == name)
            .collect()
    }

    pub fn get_symbol_definition(&self, name: &str) -> Option<SymbolLocation> {
        self.files.iter().find_map(|(path, file)| {
            file.symbols
                .iter()
                .find(|s| s.name == name)
                .map(|symbol| SymbolLocation {
                    path: path.clone(),
                    line: symbol.line,
                    symbol: symbol.clone(),
                })
        })
    }

    /// Reindex one file (dropping it if it no longer exists) or rebuild everything.
    pub async fn refresh_index(&mut self, path: Option<&Path>) -> Result<()> {
        if self.state == IndexerState::Uninitialized {
            return Err(CodectxError::NotInitialized);
        }
        match path {
            Some(path) => {
                let absolute = self.absolute(path);
                if absolute.is_file() {
                    self.index_file(&absolute).await;
                } else {
                    let key = self.key_for(&absolute);
                    if self.files.remove(&key).is_some() {
                        debug!(path = %key, "removed vanished file from index");
                    }
                }
            }
            None => {
                let paths = self.walker().source_files();
                self.rebuild(paths).await;
            }
        }
        Ok(())
    }

    pub fn get_document_outline(&self, path: &Path) -> DocumentOutline {
        DocumentOutline::build(&self.key_for(path), &self.get_symbols(path))
    }

    pub fn get_symbols_at_line(&self, path: &Path, line: usize) -> Vec<Symbol> {
        self.get_symbols(path)
            .into_iter()
            .filter(|s| s.contains_line(line))
            .collect()
    }

    pub fn get_file_metadata(&self, path: &Path) -> Option<FileMetadata> {
        self.files
            .get(&self.key_for(path))
            .map(|f| f.metadata.clone())
    }

    /// Diagnostics the file's language server published for it.
    pub fn get_diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        Language::from_path(path)
            .and_then(|language| self.servers.get(&language))
            .map(|handle| handle.session.diagnostics(&self.absolute(path)))
            .unwrap_or_default()
    }

    /// Stop every language server; heuristic lookups keep working afterwards.
    pub async fn shutdown(&mut self) {
        self.attempted.extend(Language::ALL);
        for (_, handle) in self.servers.drain() {
            handle.session.shutdown().await;
        }
        if self.state != IndexerState::Uninitialized {
            self.state = IndexerState::FallbackOnly;
        }
    }
}
