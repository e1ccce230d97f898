//! Memory Store
//!
//! Typed, embeddable records behind one of two interchangeable backends:
//! a SQLite file that scores similarity in-process, or a vector-native store that
//! answers from HNSW indexes and reports cosine distances. Ranking, filtering and retention rules live here so callers
//! see the same behaviour whichever backend is configured.

pub mod backend;
pub mod hnsw;
pub mod quality;
pub mod sqlite;
pub mod types;
pub mod vector;

pub use backend::{MemoryBackend, Neighbor, Proximity};
pub use sqlite::SqliteBackend;
pub use types::{
    CodePattern, ContextRelationship, MemoryEntry, MemoryFilter, MemoryKind, MemoryStats,
    SearchResult,
};
pub use vector::VectorBackend;

use crate::config::{CodectxConfig, RetrievalConfig, StorageBackendKind};
use crate::embedding::{EmbeddingGate, is_zero};
use crate::error::Result;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Kinds considered by relevance search, alongside stored code patterns.
const RELEVANT_KINDS: [MemoryKind; 3] =
    [MemoryKind::Conversation, MemoryKind::Context, MemoryKind::Pattern];

/// Entries scoring below this are eligible for age-based cleanup.
const RETENTION_SCORE_THRESHOLD: f32 = 0.5;

/// Cap on text passed to the quality filter and the embedder.
const MAX_EMBED_CHARS: usize = 4000;

/// An edge from `get_related_context`, resolved to its target entry.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedContext {
    pub relationship: ContextRelationship,
    pub entry: MemoryEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportItem {
    pub id: String,
    pub content: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    pub exported_at: DateTime<Utc>,
    pub backend: String,
    pub memories: Vec<ExportItem>,
    pub code_patterns: Vec<ExportItem>,
    pub relationships: Vec<ContextRelationship>,
}

pub struct MemoryStore {
    backend: Box<dyn MemoryBackend>,
    embedder: Arc<EmbeddingGate>,
    retrieval: RetrievalConfig,
    /// Last issued timestamp; keeps `created_at` strictly increasing.
    clock: Mutex<DateTime<Utc>>,
}

impl MemoryStore {
    /// Open the configured backend under the project's data directory.
    pub fn open(
        project_root: &Path,
        config: &CodectxConfig,
        embedder: Arc<EmbeddingGate>,
    ) -> Result<Self> {
        let data_dir = config.data_dir(project_root);
        let backend: Box<dyn MemoryBackend> = match config.storage.backend {
            StorageBackendKind::Sqlite => Box::new(SqliteBackend::open(&data_dir.join("memory.db"))?),
            StorageBackendKind::Vector => {
                Box::new(VectorBackend::open(&data_dir.join("vector_store"))?)
            }
        };

        info!(
            backend = config.storage.backend.as_str(),
            path = %data_dir.display(),
            embedder = embedder.provider_name(),
            "Memory store ready"
        );

        Ok(Self::with_backend(backend, embedder, config.retrieval.clone()))
    }

    pub fn with_backend(
        backend: Box<dyn MemoryBackend>,
        embedder: Arc<EmbeddingGate>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            backend,
            embedder,
            retrieval,
            clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn backend_kind(&self) -> StorageBackendKind {
        self.backend.kind()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn store_conversation(&self, payload: Value) -> Result<String> {
        self.store_entry(MemoryKind::Conversation, payload, None, vec!["conversation".into()])
            .await
    }

    /// Insert a context snapshot for `path`. Earlier snapshots are kept; the newest wins on read.
    pub async fn store_context(&self, path: &str, payload: Value) -> Result<String> {
        let mut tags = vec!["code".to_string(), "context".to_string()];
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            tags.push(ext.to_string());
        }
        self.store_entry(MemoryKind::Context, payload, Some(path.to_string()), tags)
            .await
    }

    pub async fn store_change(&self, payload: Value) -> Result<String> {
        let file_path = payload
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut tags = vec!["change".to_string()];
        if let Some(change_type) = payload.get("change_type").and_then(Value::as_str) {
            tags.push(change_type.to_string());
        }
        self.store_entry(MemoryKind::Change, payload, file_path, tags).await
    }

    /// Store a code pattern, or bump its usage count when identical content exists.
    pub async fn store_pattern(
        &self,
        pattern_type: &str,
        content: &str,
        context: Value,
    ) -> Result<String> {
        let fingerprint = fingerprint(content);

        if let Some(mut existing) = self.backend.find_pattern(&fingerprint).await? {
            existing.usage_count += 1;
            existing.last_used = self.next_timestamp();
            self.backend.update_pattern(&existing).await?;
            debug!(id = %existing.id, usage = existing.usage_count, "Reinforced code pattern");
            return Ok(existing.id);
        }

        let embedding = self.embed(content).await;
        let now = self.next_timestamp();
        let pattern = CodePattern {
            id: generate_id("pattern"),
            fingerprint,
            pattern_type: pattern_type.to_string(),
            content: content.to_string(),
            usage_count: 1,
            created_at: now,
            last_used: now,
            context,
            embedding,
        };
        self.backend.insert_pattern(&pattern).await?;
        debug!(id = %pattern.id, pattern_type, "Stored code pattern");
        Ok(pattern.id)
    }

    async fn store_entry(
        &self,
        kind: MemoryKind,
        payload: Value,
        file_path: Option<String>,
        tags: Vec<String>,
    ) -> Result<String> {
        let embedding = self.embed(&embedding_text(&payload)).await;

        let mut entry = MemoryEntry::new(
            generate_id(kind.as_str()),
            kind,
            payload,
            self.next_timestamp(),
        );
        entry.file_path = file_path;
        entry.tags = tags;
        entry.embedding = embedding;

        self.backend.insert_memory(&entry).await?;
        debug!(id = %entry.id, kind = %kind, "Stored memory");
        Ok(entry.id)
    }

    /// Adjust retention score by `delta`, clamped to `[0, max_semantic_score]`.
    ///
    /// Returns the new score, or `None` when no entry has that id.
    pub async fn update_memory_score(&self, id: &str, delta: f32) -> Result<Option<f32>> {
        let Some(mut entry) = self.backend.get_memory(id).await? else {
            warn!(id, "Score update for unknown memory");
            return Ok(None);
        };

        entry.semantic_score =
            (entry.semantic_score + delta).clamp(0.0, self.retrieval.max_semantic_score);
        entry.access_count += 1;
        entry.last_accessed = Some(self.next_timestamp());
        self.backend.update_memory(&entry).await?;

        Ok(Some(entry.semantic_score))
    }

    pub async fn add_context_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: &str,
        weight: f32,
        metadata: Value,
    ) -> Result<String> {
        let relationship = ContextRelationship {
            id: generate_id("rel"),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relationship_type: relationship_type.to_string(),
            weight,
            created_at: self.next_timestamp(),
            metadata,
        };
        self.backend.insert_relationship(&relationship).await?;
        Ok(relationship.id)
    }

    /// Delete entries older than `days` whose score is below 0.5, plus their edges.
    pub async fn cleanup_old_memories(&self, days: i64) -> Result<usize> {
        let filter = MemoryFilter {
            created_before: Some(Utc::now() - Duration::days(days)),
            score_below: Some(RETENTION_SCORE_THRESHOLD),
            ..MemoryFilter::default()
        };

        let ids: Vec<String> = self
            .backend
            .query_memories(&filter)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();

        let deleted = self.backend.delete_memories(&ids).await?;
        let edges = self.backend.delete_relationships_touching(&ids).await?;
        info!(deleted, edges, days, "Cleaned up old memories");
        Ok(deleted)
    }

    /// Write every memory, pattern and relationship to one JSON document at `path`.
    pub async fn export_memories(&self, path: &Path) -> Result<ExportDocument> {
        let memories = self.backend.query_memories(&MemoryFilter::default()).await?;
        let patterns = self.backend.all_patterns().await?;
        let relationships = self.backend.all_relationships().await?;

        let document = ExportDocument {
            exported_at: Utc::now(),
            backend: self.backend_kind().as_str().to_string(),
            memories: memories
                .iter()
                .rev()
                .map(|e| ExportItem {
                    id: e.id.clone(),
                    content: e.content.clone(),
                    metadata: e.metadata(),
                })
                .collect(),
            code_patterns: patterns
                .iter()
                .map(|p| ExportItem {
                    id: p.id.clone(),
                    content: Value::String(p.content.clone()),
                    metadata: p.metadata(),
                })
                .collect(),
            relationships,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&document)?)?;

        info!(
            path = %path.display(),
            memories = document.memories.len(),
            patterns = document.code_patterns.len(),
            relationships = document.relationships.len(),
            "Exported memories"
        );
        Ok(document)
    }

    // ------------------------------------------------------------------
    // Reads: storage failures are logged and degrade to empty results
    // ------------------------------------------------------------------

    /// Most relevant conversations, contexts and patterns for `query`.
    ///
    /// Uses vector similarity when the query embeds to a non-zero vector and falls
    /// back to keyword matching otherwise.
    pub async fn search_relevant_context(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        if limit == 0 {
            return Vec::new();
        }

        let query_embedding = self.embed(query).await;
        let result = if is_zero(&query_embedding) {
            self.keyword_search(query, limit).await
        } else {
            self.vector_candidates(&query_embedding, &RELEVANT_KINDS, true, limit * 2)
                .await
                .map(|candidates| {
                    let candidates = if self.retrieval.quality_filter {
                        candidates
                            .into_iter()
                            .filter(|(_, text)| !quality::is_low_quality(text))
                            .collect()
                    } else {
                        candidates
                    };
                    rank_within(candidates, self.retrieval.max_relevant_distance, limit)
                })
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Relevant context search failed");
            Vec::new()
        })
    }

    /// Stored code patterns closest to `code`.
    pub async fn find_similar_code(&self, code: &str, limit: usize) -> Vec<SearchResult> {
        if code.trim().is_empty() || limit == 0 {
            return Vec::new();
        }

        let query_embedding = self.embed(code).await;
        if is_zero(&query_embedding) {
            return Vec::new();
        }

        match self
            .vector_candidates(&query_embedding, &[MemoryKind::Pattern], true, limit * 2)
            .await
        {
            Ok(candidates) => {
                rank_within(candidates, self.retrieval.max_similar_code_distance, limit)
            }
            Err(e) => {
                warn!(error = %e, "Similar code search failed");
                Vec::new()
            }
        }
    }

    /// Vector similarity over every entry and pattern, without a kind filter.
    pub async fn semantic_search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        if limit == 0 {
            return Vec::new();
        }

        let query_embedding = self.embed(query).await;
        if is_zero(&query_embedding) {
            return Vec::new();
        }

        match self
            .vector_candidates(&query_embedding, &[], true, limit * 2)
            .await
        {
            Ok(candidates) => rank_within(candidates, self.retrieval.max_semantic_distance, limit),
            Err(e) => {
                warn!(error = %e, "Semantic search failed");
                Vec::new()
            }
        }
    }

    /// Conversations, newest first.
    pub async fn get_recent_conversations(&self, limit: usize) -> Vec<MemoryEntry> {
        let filter = MemoryFilter::kinds(&[MemoryKind::Conversation]).with_limit(limit);
        self.backend.query_memories(&filter).await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load recent conversations");
            Vec::new()
        })
    }

    /// Newest context snapshot stored for `path`.
    pub async fn get_file_context(&self, path: &str) -> Option<MemoryEntry> {
        let filter = MemoryFilter {
            kinds: vec![MemoryKind::Context],
            file_path: Some(path.to_string()),
            limit: Some(1),
            ..MemoryFilter::default()
        };
        match self.backend.query_memories(&filter).await {
            Ok(entries) => entries.into_iter().next(),
            Err(e) => {
                warn!(error = %e, path, "Failed to load file context");
                None
            }
        }
    }

    /// Entries linked from `id`, heaviest edge first.
    pub async fn get_related_context(
        &self,
        id: &str,
        relationship_type: Option<&str>,
        limit: usize,
    ) -> Vec<RelatedContext> {
        let mut edges = match self.backend.relationships_from(id, relationship_type).await {
            Ok(edges) => edges,
            Err(e) => {
                warn!(error = %e, id, "Failed to load relationships");
                return Vec::new();
            }
        };
        edges.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let mut related = Vec::new();
        for relationship in edges {
            if related.len() >= limit {
                break;
            }
            match self.backend.get_memory(&relationship.target_id).await {
                Ok(Some(entry)) => related.push(RelatedContext {
                    relationship,
                    entry,
                }),
                Ok(None) => debug!(target = %relationship.target_id, "Relationship target missing"),
                Err(e) => warn!(error = %e, "Failed to resolve relationship target"),
            }
        }
        related
    }

    pub async fn stats(&self) -> MemoryStats {
        let count = |kind: MemoryKind| async move {
            self.backend.count_memories(kind).await.unwrap_or_else(|e| {
                warn!(error = %e, kind = %kind, "Failed to count memories");
                0
            })
        };

        MemoryStats {
            backend: self.backend_kind().as_str().to_string(),
            conversations: count(MemoryKind::Conversation).await,
            contexts: count(MemoryKind::Context).await,
            changes: count(MemoryKind::Change).await,
            patterns: self.backend.all_patterns().await.map(|p| p.len()).unwrap_or(0),
            relationships: self
                .backend
                .all_relationships()
                .await
                .map(|r| r.len())
                .unwrap_or(0),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn embed(&self, text: &str) -> Vec<f32> {
        let truncated: String = text.chars().take(MAX_EMBED_CHARS).collect();
        self.embedder.embed(&truncated).await
    }

    /// Vector hits from memories of `kinds` and, optionally, code patterns,
    /// paired with the text used by the quality filter.
    async fn vector_candidates(
        &self,
        query: &[f32],
        kinds: &[MemoryKind],
        include_patterns: bool,
        fetch: usize,
    ) -> Result<Vec<(SearchResult, String)>> {
        let mut candidates = Vec::new();

        for neighbor in self.backend.vector_search(query, kinds, fetch).await? {
            let text = embedding_text(&neighbor.item.content);
            candidates.push((
                SearchResult::from_entry(&neighbor.item, neighbor.proximity.similarity()),
                text,
            ));
        }

        if include_patterns {
            for neighbor in self.backend.pattern_search(query, fetch).await? {
                candidates.push((
                    SearchResult::from_pattern(&neighbor.item, neighbor.proximity.similarity()),
                    neighbor.item.content.clone(),
                ));
            }
        }

        Ok(candidates)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let keywords: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let score = |haystack: &str| {
            let haystack = haystack.to_lowercase();
            let matched = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
            matched as f32 / keywords.len() as f32
        };

        let mut results = Vec::new();
        for entry in self
            .backend
            .query_memories(&MemoryFilter::kinds(&RELEVANT_KINDS))
            .await?
        {
            let relevance = score(&entry.content.to_string());
            if relevance > 0.0 {
                let mut result = SearchResult::from_entry(&entry, 0.0);
                result.relevance = relevance;
                results.push(result);
            }
        }
        for pattern in self.backend.all_patterns().await? {
            let relevance = score(&pattern.content);
            if relevance > 0.0 {
                let mut result = SearchResult::from_pattern(&pattern, 0.0);
                result.relevance = relevance;
                results.push(result);
            }
        }

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        results.truncate(limit);
        Ok(results)
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let ts = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = ts;
        ts
    }
}

/// Apply the cosine-distance cutoff, score relevance, rank, and keep the top `limit`.
///
/// Candidates with no positive similarity never match, whatever the cutoff.
fn rank_within(
    candidates: Vec<(SearchResult, String)>,
    max_distance: f32,
    limit: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|(result, _)| result)
        .filter(|r| r.similarity > 0.0 && r.distance <= max_distance)
        .map(|mut r| {
            r.relevance = if max_distance > 0.0 {
                (1.0 - r.distance / max_distance).max(0.0)
            } else {
                0.0
            };
            r
        })
        .collect();

    results.sort_by(|a, b| {
        backend::rank_order(
            (a.similarity, &a.created_at, &a.id),
            (b.similarity, &b.created_at, &b.id),
        )
    });
    results.truncate(limit);
    results
}

/// Stable dedup key for pattern content.
pub fn fingerprint(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

fn generate_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..12])
}

/// Text representation of a payload for embedding and keyword matching.
fn embedding_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
