//! Memory types - entries, code patterns, relationships and search results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::CodectxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Conversation,
    Context,
    Change,
    Pattern,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Conversation,
        MemoryKind::Context,
        MemoryKind::Change,
        MemoryKind::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Context => "context",
            MemoryKind::Change => "change",
            MemoryKind::Pattern => "pattern",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = CodectxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(MemoryKind::Conversation),
            "context" => Ok(MemoryKind::Context),
            "change" => Ok(MemoryKind::Change),
            "pattern" => Ok(MemoryKind::Pattern),
            other => Err(CodectxError::Storage(format!("unknown memory kind '{}'", other))),
        }
    }
}

/// A stored memory. Only score, access count and last access ever change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub kind: MemoryKind,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub file_path: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub semantic_score: f32,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn new(id: String, kind: MemoryKind, content: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            content,
            created_at,
            file_path: None,
            tags: Vec::new(),
            embedding: Vec::new(),
            semantic_score: 1.0,
            access_count: 0,
            last_accessed: None,
        }
    }

    /// Metadata fields as they appear in exports.
    pub fn metadata(&self) -> Value {
        serde_json::json!({
            "kind": self.kind,
            "created_at": self.created_at.to_rfc3339(),
            "file_path": self.file_path,
            "tags": self.tags,
            "semantic_score": self.semantic_score,
            "access_count": self.access_count,
            "last_accessed": self.last_accessed.map(|t| t.to_rfc3339()),
        })
    }
}

/// A deduplicated code snippet keyed by its content fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodePattern {
    pub id: String,
    pub fingerprint: String,
    pub pattern_type: String,
    pub content: String,
    pub usage_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub context: Value,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl CodePattern {
    pub fn metadata(&self) -> Value {
        serde_json::json!({
            "fingerprint": self.fingerprint,
            "pattern_type": self.pattern_type,
            "usage_count": self.usage_count,
            "created_at": self.created_at.to_rfc3339(),
            "last_used": self.last_used.to_rfc3339(),
            "context": self.context,
        })
    }

    /// File the pattern was captured from, when its context recorded one.
    pub fn file_path(&self) -> Option<String> {
        self.context
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Directed weighted edge between two memory ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Selection criteria for `MemoryBackend::query_memories`. Empty `kinds` means every kind.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub kinds: Vec<MemoryKind>,
    pub file_path: Option<String>,
    /// Only entries created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Only entries whose score is strictly below this value.
    pub score_below: Option<f32>,
    pub limit: Option<usize>,
}

impl MemoryFilter {
    pub fn kinds(kinds: &[MemoryKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&entry.kind))
            && self
                .file_path
                .as_ref()
                .is_none_or(|p| entry.file_path.as_ref() == Some(p))
            && self.created_before.is_none_or(|t| entry.created_at < t)
            && self.score_below.is_none_or(|s| entry.semantic_score < s)
    }
}

/// One ranked hit from any of the store's search operations.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub kind: MemoryKind,
    pub content: Value,
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Cosine similarity, or 0 for keyword matches.
    pub similarity: f32,
    pub distance: f32,
    /// Distance scaled into [0, 1] against the search's distance cutoff.
    pub relevance: f32,
}

impl SearchResult {
    pub fn from_entry(entry: &MemoryEntry, similarity: f32) -> Self {
        Self {
            id: entry.id.clone(),
            kind: entry.kind,
            content: entry.content.clone(),
            file_path: entry.file_path.clone(),
            created_at: entry.created_at,
            similarity,
            distance: 1.0 - similarity,
            relevance: 0.0,
        }
    }

    pub fn from_pattern(pattern: &CodePattern, similarity: f32) -> Self {
        Self {
            id: pattern.id.clone(),
            kind: MemoryKind::Pattern,
            content: serde_json::json!({
                "pattern_type": pattern.pattern_type,
                "content": pattern.content,
                "usage_count": pattern.usage_count,
                "last_used": pattern.last_used.to_rfc3339(),
                "context": pattern.context,
            }),
            file_path: pattern.file_path(),
            created_at: pattern.created_at,
            similarity,
            distance: 1.0 - similarity,
            relevance: 0.0,
        }
    }

    /// Short single-line rendering used in formatted context.
    pub fn summary(&self, max_chars: usize) -> String {
        let text = match &self.content {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("content")
                .or_else(|| map.get("query"))
                .or_else(|| map.get("diff"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| self.content.to_string()),
            other => other.to_string(),
        };
        let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() > max_chars {
            let truncated: String = flat.chars().take(max_chars).collect();
            format!("{}...", truncated)
        } else {
            flat
        }
    }
}

/// Row counts per collection, for stats output.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub backend: String,
    pub conversations: usize,
    pub contexts: usize,
    pub changes: usize,
    pub patterns: usize,
    pub relationships: usize,
}

impl MemoryStats {
    pub fn format(&self) -> String {
        format!(
            "Memory Stats ({}):\n\
            - Conversations: {}\n\
            - Contexts: {}\n\
            - Changes: {}\n\
            - Code patterns: {}\n\
            - Relationships: {}",
            self.backend,
            self.conversations,
            self.contexts,
            self.changes,
            self.patterns,
            self.relationships
        )
    }
}
