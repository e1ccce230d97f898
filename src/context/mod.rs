//! Context orchestration: ties the memory store and the symbol index to the
//! editor's current state and assembles context bundles for model queries.

pub mod bundle;
pub mod diff;
pub mod project;
pub mod ring;

pub use bundle::{ContextBundle, CursorPosition};
pub use project::ProjectOverview;
pub use ring::BoundedRing;

use crate::config::CodectxConfig;
use crate::embedding::EmbeddingGate;
use crate::error::Result;
use crate::indexer::{Language, Symbol, SymbolIndexer, SymbolLocation};
use crate::memory::{
    ExportDocument, MemoryEntry, MemoryStats, MemoryStore, RelatedContext, SearchResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SEARCH_LIMIT: usize = 5;
const SIMILAR_CODE_LIMIT: usize = 3;
const PREVIEW_CHARS: usize = 200;

/// One recorded edit.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub change_type: String,
    pub old_content: String,
    pub new_content: String,
    pub diff: String,
}

/// What the editor is looking at right now.
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    pub project_root: PathBuf,
    pub language: Language,
    pub current_file: Option<String>,
    pub selected_code: Option<String>,
    pub cursor_position: Option<CursorPosition>,
    pub symbols: Vec<Symbol>,
    pub dependencies: Vec<String>,
    pub recent_changes: BoundedRing<ChangeRecord>,
}

impl AgentContext {
    fn new(project_root: &Path, language: Language, history: usize) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            language,
            current_file: None,
            selected_code: None,
            cursor_position: None,
            symbols: Vec::new(),
            dependencies: Vec::new(),
            recent_changes: BoundedRing::new(history),
        }
    }

    /// No active file or no selection.
    fn is_general(&self) -> bool {
        self.current_file.is_none() || self.selected_code.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub query: String,
    pub context: ContextBundle,
    pub suggestions: Vec<String>,
    pub related_files: Vec<String>,
}

pub struct ContextOrchestrator {
    config: CodectxConfig,
    memory: MemoryStore,
    indexer: SymbolIndexer,
    context: AgentContext,
}

impl ContextOrchestrator {
    pub async fn initialize(project_root: &Path, config: CodectxConfig) -> Result<Self> {
        let embedder = Arc::new(EmbeddingGate::from_config(&config.embedding));
        let memory = MemoryStore::open(project_root, &config, embedder)?;

        let mut indexer = SymbolIndexer::new(config.indexer.clone());
        indexer.initialize(project_root).await?;

        let context = AgentContext::new(
            project_root,
            indexer.language(),
            config.context.change_history,
        );

        info!(
            root = %project_root.display(),
            language = %indexer.language(),
            files = indexer.file_count(),
            "context engine initialized"
        );

        Ok(Self {
            config,
            memory,
            indexer,
            context,
        })
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.context.project_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub async fn update_context(
        &mut self,
        path: &Path,
        selection: Option<&str>,
        cursor: Option<CursorPosition>,
    ) -> Result<()> {
        self.indexer.refresh_index(Some(path)).await?;

        let file = self.relative(path);
        self.context.current_file = Some(file.clone());
        self.context.selected_code = selection.map(str::to_string);
        self.context.cursor_position = cursor;
        self.context.symbols = self.indexer.get_symbols(path);
        self.context.dependencies = self.indexer.get_dependencies(path);

        let language = Language::from_path(path).unwrap_or(self.context.language);
        let payload = json!({
            "file_path": file,
            "language": language,
            "selected_code": self.context.selected_code,
            "cursor_position": self.context.cursor_position,
            "symbols": self.context.symbols,
            "dependencies": self.context.dependencies,
        });
        if let Err(e) = self.memory.store_context(&file, payload).await {
            warn!(error = %e, file = %file, "failed to persist context snapshot");
        }
        Ok(())
    }

    /// Assemble everything known about the current state and `query`. Never fails.
    pub async fn get_enhanced_context(&self, query: &str) -> ContextBundle {
        let ctx = &self.context;
        let current = ctx.current_file.as_deref().map(Path::new);

        let project_symbols = if ctx.is_general() {
            self.indexer
                .get_project_symbols()
                .into_iter()
                .filter(|loc| loc.symbol.container.is_none())
                .collect()
        } else {
            Vec::new()
        };

        let similar_patterns = match &ctx.selected_code {
            Some(selection) => {
                self.memory
                    .find_similar_code(selection, SIMILAR_CODE_LIMIT)
                    .await
            }
            None => Vec::new(),
        };

        ContextBundle {
            query: query.to_string(),
            project_root: ctx.project_root.display().to_string(),
            language: ctx.language,
            current_file: ctx.current_file.clone(),
            selected_code: ctx.selected_code.clone(),
            cursor_position: ctx.cursor_position,
            dependencies: ctx.dependencies.clone(),
            symbols: ctx.symbols.clone(),
            cursor_symbols: match (current, ctx.cursor_position) {
                (Some(path), Some(cursor)) => self.indexer.get_symbols_at_line(path, cursor.line),
                _ => Vec::new(),
            },
            diagnostics: current
                .map(|p| self.indexer.get_diagnostics(p))
                .unwrap_or_default(),
            recent_changes: ctx.recent_changes.len(),
            outline: current.map(|p| self.indexer.get_document_outline(p)),
            file_metadata: current.and_then(|p| self.indexer.get_file_metadata(p)),
            project_overview: ProjectOverview::collect(
                &ctx.project_root,
                self.config.context.tree_depth,
                self.config.context.readme_lines,
            ),
            project_symbols,
            semantic_context: self.memory.semantic_search(query, SEARCH_LIMIT).await,
            relevant_history: self.memory.search_relevant_context(query, SEARCH_LIMIT).await,
            similar_patterns,
        }
    }

    pub async fn record_change(
        &mut self,
        path: &Path,
        change_type: &str,
        old_content: &str,
        new_content: &str,
    ) -> Result<()> {
        let record = ChangeRecord {
            timestamp: Utc::now(),
            file_path: self.relative(path),
            change_type: change_type.to_string(),
            old_content: old_content.to_string(),
            new_content: new_content.to_string(),
            diff: diff::unified_diff(old_content, new_content),
        };

        let (added, removed) = diff::line_changes(old_content, new_content);
        debug!(file = %record.file_path, change_type, added, removed, "recording change");

        let payload = serde_json::to_value(&record)?;
        if self.context.recent_changes.push(record).is_some() {
            debug!("change history full, dropped oldest record");
        }
        self.memory.store_change(payload).await?;

        if !new_content.trim().is_empty() {
            let file = self.relative(path);
            self.memory
                .store_pattern(
                    &format!("change:{}", change_type),
                    new_content,
                    json!({ "file_path": file, "change_type": change_type }),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn process_request(&mut self, query: &str) -> AgentResponse {
        let conversation = json!({
            "query": query,
            "timestamp": Utc::now(),
            "file_path": self.context.current_file,
        });
        if let Err(e) = self.memory.store_conversation(conversation).await {
            warn!(error = %e, "failed to persist conversation");
        }

        let context = self.get_enhanced_context(query).await;
        let suggestions = suggestions_for(query, &context);
        let related_files = related_files_for(&context);

        AgentResponse {
            query: query.to_string(),
            context,
            suggestions,
            related_files,
        }
    }

    /// Pull a file into the conversation, reading it from disk unless `content` is given.
    pub async fn add_context_file(&mut self, path: &Path, content: Option<&str>) -> Result<()> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.context.project_root.join(path)
        };
        let content = match content {
            Some(c) => c.to_string(),
            None => tokio::fs::read_to_string(&absolute).await?,
        };

        let file = self.relative(&absolute);
        let language = Language::from_path(&absolute)
            .map(|l| l.name())
            .unwrap_or("unknown");
        let preview: String = content.chars().take(PREVIEW_CHARS).collect();

        self.memory
            .store_conversation(json!({
                "type": "context_addition",
                "file_path": file,
                "language": language,
                "preview": preview,
            }))
            .await?;
        self.indexer.refresh_index(Some(&absolute)).await?;
        info!(file = %file, "added file to context");
        Ok(())
    }

    pub fn agent_context(&self) -> &AgentContext {
        &self.context
    }

    /// Newest last.
    pub fn recent_changes(&self) -> Vec<&ChangeRecord> {
        self.context.recent_changes.iter().collect()
    }

    pub fn indexer(&self) -> &SymbolIndexer {
        &self.indexer
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn get_symbols(&self, path: &Path) -> Vec<Symbol> {
        self.indexer.get_symbols(path)
    }

    pub fn get_dependencies(&self, path: &Path) -> Vec<String> {
        self.indexer.get_dependencies(path)
    }

    pub fn find_symbol_references(&self, name: &str) -> Vec<SymbolLocation> {
        self.indexer.find_symbol_references(name)
    }

    pub fn get_symbol_definition(&self, name: &str) -> Option<SymbolLocation> {
        self.indexer.get_symbol_definition(name)
    }

    pub async fn get_recent_conversations(&self, limit: usize) -> Vec<MemoryEntry> {
        self.memory.get_recent_conversations(limit).await
    }

    pub async fn semantic_search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        self.memory.semantic_search(query, limit).await
    }

    pub async fn add_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: &str,
        weight: f32,
    ) -> Result<String> {
        self.memory
            .add_context_relationship(source_id, target_id, relationship_type, weight, json!({}))
            .await
    }

    pub async fn get_related_context(
        &self,
        id: &str,
        relationship_type: Option<&str>,
        limit: usize,
    ) -> Vec<RelatedContext> {
        self.memory
            .get_related_context(id, relationship_type, limit)
            .await
    }

    /// Adjust an entry's retention score; `None` when the id is unknown.
    pub async fn reinforce(&self, id: &str, delta: f32) -> Result<Option<f32>> {
        self.memory.update_memory_score(id, delta).await
    }

    pub async fn cleanup(&self, days: i64) -> Result<usize> {
        self.memory.cleanup_old_memories(days).await
    }

    pub async fn export(&self, path: &Path) -> Result<ExportDocument> {
        self.memory.export_memories(path).await
    }

    pub async fn stats(&self) -> MemoryStats {
        self.memory.stats().await
    }

    pub async fn shutdown(&mut self) {
        self.indexer.shutdown().await;
        info!("context engine shut down");
    }
}

fn suggestions_for(query: &str, context: &ContextBundle) -> Vec<String> {
    let query = query.to_lowercase();
    let mut suggestions = Vec::new();

    if query.contains("completion") || query.contains("suggest") {
        suggestions.extend(
            context
                .symbols
                .iter()
                .take(3)
                .map(|s| format!("Consider using existing symbol: {}", s.name)),
        );
    }
    if query.contains("error") || query.contains("fix") {
        suggestions.push("Check for syntax errors in the current file".to_string());
        suggestions.push("Verify all imports are available".to_string());
    }
    if query.contains("refactor") || query.contains("improve") {
        suggestions.push("Consider extracting repeated code into functions".to_string());
        suggestions.push("Add type annotations for better code clarity".to_string());
    }
    suggestions
}

fn related_files_for(context: &ContextBundle) -> Vec<String> {
    let mut related: Vec<String> = context
        .dependencies
        .iter()
        .take(3)
        .map(|d| format!("Check dependency: {}", d))
        .collect();

    related.extend(
        context
            .similar_patterns
            .iter()
            .take(2)
            .filter_map(|p| p.file_path.as_ref())
            .map(|p| format!("Similar pattern in: {}", p)),
    );
    related
}

/// Payload field lookup used when rendering stored entries.
pub fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}
