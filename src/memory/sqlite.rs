//! Relational backend: SQLite file, similarity computed in-process

use super::backend::{
    MemoryBackend, Neighbor, Proximity, sort_entry_neighbors, sort_pattern_neighbors,
};
use super::types::{CodePattern, ContextRelationship, MemoryEntry, MemoryFilter, MemoryKind};
use crate::config::StorageBackendKind;
use crate::embedding::{cosine_similarity, is_zero};
use crate::error::{CodectxError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        file_path TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        embedding BLOB,
        semantic_score REAL NOT NULL DEFAULT 1.0,
        access_count INTEGER NOT NULL DEFAULT 0,
        last_accessed TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind, created_at);
    CREATE INDEX IF NOT EXISTS idx_memories_file ON memories(file_path);

    CREATE TABLE IF NOT EXISTS code_patterns (
        id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL UNIQUE,
        pattern_type TEXT NOT NULL,
        content TEXT NOT NULL,
        usage_count INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_used TEXT NOT NULL,
        context TEXT NOT NULL DEFAULT '{}',
        embedding BLOB
    );

    CREATE TABLE IF NOT EXISTS relationships (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        relationship_type TEXT NOT NULL,
        weight REAL NOT NULL,
        created_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
";

/// Ids bound per DELETE, well under SQLite's host parameter limit.
const DELETE_BATCH: usize = 500;

const MEMORY_COLUMNS: &str = "id, kind, content, created_at, file_path, tags, embedding, \
                              semantic_score, access_count, last_accessed";

const PATTERN_COLUMNS: &str =
    "id, fingerprint, pattern_type, content, usage_count, created_at, last_used, context, embedding";

const RELATIONSHIP_COLUMNS: &str =
    "id, source_id, target_id, relationship_type, weight, created_at, metadata";

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // WAL is unavailable on some filesystems; rollback journal still works.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(SCHEMA)?;

        debug!(path = %path.display(), "Opened SQLite memory store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(CodectxError::poisoned)
    }
}

pub(crate) fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CodectxError::Storage(format!("bad timestamp '{}': {}", s, e)))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Raw column values; decoded outside the rusqlite row closure so errors keep their type.
struct MemoryRow {
    id: String,
    kind: String,
    content: String,
    created_at: String,
    file_path: Option<String>,
    tags: String,
    embedding: Option<Vec<u8>>,
    semantic_score: f64,
    access_count: i64,
    last_accessed: Option<String>,
}

impl MemoryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
            file_path: row.get(4)?,
            tags: row.get(5)?,
            embedding: row.get(6)?,
            semantic_score: row.get(7)?,
            access_count: row.get(8)?,
            last_accessed: row.get(9)?,
        })
    }

    fn decode(self) -> Result<MemoryEntry> {
        Ok(MemoryEntry {
            id: self.id,
            kind: self.kind.parse()?,
            content: serde_json::from_str(&self.content)?,
            created_at: parse_timestamp(&self.created_at)?,
            file_path: self.file_path,
            tags: serde_json::from_str(&self.tags)?,
            embedding: self.embedding.as_deref().map(decode_embedding).unwrap_or_default(),
            semantic_score: self.semantic_score as f32,
            access_count: self.access_count.max(0) as u32,
            last_accessed: self.last_accessed.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

struct PatternRow {
    id: String,
    fingerprint: String,
    pattern_type: String,
    content: String,
    usage_count: i64,
    created_at: String,
    last_used: String,
    context: String,
    embedding: Option<Vec<u8>>,
}

impl PatternRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            fingerprint: row.get(1)?,
            pattern_type: row.get(2)?,
            content: row.get(3)?,
            usage_count: row.get(4)?,
            created_at: row.get(5)?,
            last_used: row.get(6)?,
            context: row.get(7)?,
            embedding: row.get(8)?,
        })
    }

    fn decode(self) -> Result<CodePattern> {
        Ok(CodePattern {
            id: self.id,
            fingerprint: self.fingerprint,
            pattern_type: self.pattern_type,
            content: self.content,
            usage_count: self.usage_count.max(0) as u32,
            created_at: parse_timestamp(&self.created_at)?,
            last_used: parse_timestamp(&self.last_used)?,
            context: serde_json::from_str(&self.context)?,
            embedding: self.embedding.as_deref().map(decode_embedding).unwrap_or_default(),
        })
    }
}

struct RelationshipRow {
    id: String,
    source_id: String,
    target_id: String,
    relationship_type: String,
    weight: f64,
    created_at: String,
    metadata: String,
}

impl RelationshipRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            target_id: row.get(2)?,
            relationship_type: row.get(3)?,
            weight: row.get(4)?,
            created_at: row.get(5)?,
            metadata: row.get(6)?,
        })
    }

    fn decode(self) -> Result<ContextRelationship> {
        Ok(ContextRelationship {
            id: self.id,
            source_id: self.source_id,
            target_id: self.target_id,
            relationship_type: self.relationship_type,
            weight: self.weight as f32,
            created_at: parse_timestamp(&self.created_at)?,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn kind_placeholders(kinds: &[MemoryKind], first_index: usize) -> String {
    (0..kinds.len())
        .map(|i| format!("?{}", first_index + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn id_placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Sqlite
    }

    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO memories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                MEMORY_COLUMNS
            ),
            params![
                entry.id,
                entry.kind.as_str(),
                serde_json::to_string(&entry.content)?,
                format_timestamp(&entry.created_at),
                entry.file_path,
                serde_json::to_string(&entry.tags)?,
                encode_embedding(&entry.embedding),
                entry.semantic_score as f64,
                entry.access_count as i64,
                entry.last_accessed.as_ref().map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
                params![id],
                MemoryRow::read,
            )
            .optional()?;
        row.map(MemoryRow::decode).transpose()
    }

    async fn update_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE memories SET semantic_score = ?1, access_count = ?2, last_accessed = ?3 \
             WHERE id = ?4",
            params![
                entry.semantic_score as f64,
                entry.access_count as i64,
                entry.last_accessed.as_ref().map(format_timestamp),
                entry.id,
            ],
        )?;
        if changed == 0 {
            return Err(CodectxError::Storage(format!("memory {} not found", entry.id)));
        }
        Ok(())
    }

    async fn query_memories(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if !filter.kinds.is_empty() {
            clauses.push(format!(
                "kind IN ({})",
                kind_placeholders(&filter.kinds, values.len() + 1)
            ));
            values.extend(filter.kinds.iter().map(|k| SqlValue::Text(k.as_str().to_string())));
        }
        if let Some(path) = &filter.file_path {
            values.push(SqlValue::Text(path.clone()));
            clauses.push(format!("file_path = ?{}", values.len()));
        }
        if let Some(before) = &filter.created_before {
            values.push(SqlValue::Text(format_timestamp(before)));
            clauses.push(format!("created_at < ?{}", values.len()));
        }
        if let Some(score) = filter.score_below {
            values.push(SqlValue::Real(score as f64));
            clauses.push(format!("semantic_score < ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM memories", MEMORY_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            values.push(SqlValue::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), MemoryRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(MemoryRow::decode).collect()
    }

    async fn vector_search(
        &self,
        query: &[f32],
        kinds: &[MemoryKind],
        limit: usize,
    ) -> Result<Vec<Neighbor<MemoryEntry>>> {
        let candidates = self.query_memories(&MemoryFilter::kinds(kinds)).await?;

        let mut neighbors: Vec<Neighbor<MemoryEntry>> = candidates
            .into_iter()
            .filter(|entry| !entry.embedding.is_empty() && !is_zero(&entry.embedding))
            .map(|entry| {
                let similarity = cosine_similarity(query, &entry.embedding);
                Neighbor {
                    item: entry,
                    proximity: Proximity::Similarity(similarity),
                }
            })
            .collect();

        sort_entry_neighbors(&mut neighbors);
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    async fn delete_memories(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for batch in ids.chunks(DELETE_BATCH) {
            deleted += tx.execute(
                &format!("DELETE FROM memories WHERE id IN ({})", id_placeholders(batch.len())),
                params_from_iter(batch.iter()),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn find_pattern(&self, fingerprint: &str) -> Result<Option<CodePattern>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM code_patterns WHERE fingerprint = ?1", PATTERN_COLUMNS),
                params![fingerprint],
                PatternRow::read,
            )
            .optional()?;
        row.map(PatternRow::decode).transpose()
    }

    async fn insert_pattern(&self, pattern: &CodePattern) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO code_patterns ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                PATTERN_COLUMNS
            ),
            params![
                pattern.id,
                pattern.fingerprint,
                pattern.pattern_type,
                pattern.content,
                pattern.usage_count as i64,
                format_timestamp(&pattern.created_at),
                format_timestamp(&pattern.last_used),
                serde_json::to_string(&pattern.context)?,
                encode_embedding(&pattern.embedding),
            ],
        )?;
        Ok(())
    }

    async fn update_pattern(&self, pattern: &CodePattern) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE code_patterns SET usage_count = ?1, last_used = ?2 WHERE id = ?3",
            params![
                pattern.usage_count as i64,
                format_timestamp(&pattern.last_used),
                pattern.id,
            ],
        )?;
        Ok(())
    }

    async fn pattern_search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<Neighbor<CodePattern>>> {
        let mut neighbors: Vec<Neighbor<CodePattern>> = self
            .all_patterns()
            .await?
            .into_iter()
            .filter(|p| !p.embedding.is_empty() && !is_zero(&p.embedding))
            .map(|p| {
                let similarity = cosine_similarity(query, &p.embedding);
                Neighbor {
                    item: p,
                    proximity: Proximity::Similarity(similarity),
                }
            })
            .collect();

        sort_pattern_neighbors(&mut neighbors);
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    async fn all_patterns(&self) -> Result<Vec<CodePattern>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM code_patterns ORDER BY created_at ASC, id ASC",
            PATTERN_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], PatternRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PatternRow::decode).collect()
    }

    async fn insert_relationship(&self, relationship: &ContextRelationship) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO relationships ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                RELATIONSHIP_COLUMNS
            ),
            params![
                relationship.id,
                relationship.source_id,
                relationship.target_id,
                relationship.relationship_type,
                relationship.weight as f64,
                format_timestamp(&relationship.created_at),
                serde_json::to_string(&relationship.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn relationships_from(
        &self,
        source_id: &str,
        relationship_type: Option<&str>,
    ) -> Result<Vec<ContextRelationship>> {
        let conn = self.lock()?;
        let rows = match relationship_type {
            Some(rel_type) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM relationships WHERE source_id = ?1 AND relationship_type = ?2 \
                     ORDER BY weight DESC, created_at DESC",
                    RELATIONSHIP_COLUMNS
                ))?;
                stmt.query_map(params![source_id, rel_type], RelationshipRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM relationships WHERE source_id = ?1 \
                     ORDER BY weight DESC, created_at DESC",
                    RELATIONSHIP_COLUMNS
                ))?;
                stmt.query_map(params![source_id], RelationshipRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        rows.into_iter().map(RelationshipRow::decode).collect()
    }

    async fn all_relationships(&self) -> Result<Vec<ContextRelationship>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM relationships ORDER BY created_at ASC, id ASC",
            RELATIONSHIP_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], RelationshipRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RelationshipRow::decode).collect()
    }

    async fn delete_relationships_touching(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for batch in ids.chunks(DELETE_BATCH) {
            deleted += tx.execute(
                &format!(
                    "DELETE FROM relationships WHERE source_id IN ({0}) OR target_id IN ({0})",
                    id_placeholders(batch.len())
                ),
                params_from_iter(batch.iter()),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn count_memories(&self, kind: MemoryKind) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(id: &str, kind: MemoryKind, age_secs: i64, embedding: Vec<f32>) -> MemoryEntry {
        let mut e = MemoryEntry::new(
            id.to_string(),
            kind,
            json!({ "text": id }),
            Utc::now() - Duration::seconds(age_secs),
        );
        e.embedding = embedding;
        e
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.insert_memory(&entry("a", MemoryKind::Conversation, 30, vec![])).await.unwrap();
        backend.insert_memory(&entry("b", MemoryKind::Change, 20, vec![])).await.unwrap();
        backend.insert_memory(&entry("c", MemoryKind::Conversation, 10, vec![])).await.unwrap();

        let found = backend
            .query_memories(&MemoryFilter::kinds(&[MemoryKind::Conversation]))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let limited = backend
            .query_memories(&MemoryFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited[0].id, "c");
    }

    #[tokio::test]
    async fn test_vector_search_skips_unscored_entries() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .insert_memory(&entry("near", MemoryKind::Context, 5, vec![1.0, 0.0]))
            .await
            .unwrap();
        backend
            .insert_memory(&entry("far", MemoryKind::Context, 5, vec![0.0, 1.0]))
            .await
            .unwrap();
        backend
            .insert_memory(&entry("blank", MemoryKind::Context, 5, vec![0.0, 0.0]))
            .await
            .unwrap();

        let hits = backend.vector_search(&[1.0, 0.0], &[], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|n| n.item.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!((hits[0].proximity.similarity() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_fingerprint_is_unique() {
        let backend = SqliteBackend::in_memory().unwrap();
        let now = Utc::now();
        let pattern = CodePattern {
            id: "p1".into(),
            fingerprint: "abc".into(),
            pattern_type: "function".into(),
            content: "def f(): pass".into(),
            usage_count: 1,
            created_at: now,
            last_used: now,
            context: json!({}),
            embedding: vec![],
        };
        backend.insert_pattern(&pattern).await.unwrap();

        let dup = CodePattern {
            id: "p2".into(),
            ..pattern.clone()
        };
        assert!(backend.insert_pattern(&dup).await.is_err());
        assert_eq!(backend.find_pattern("abc").await.unwrap().unwrap().id, "p1");
    }

    #[tokio::test]
    async fn test_relationship_cleanup() {
        let backend = SqliteBackend::in_memory().unwrap();
        let now = Utc::now();
        for (id, src, dst) in [("r1", "a", "b"), ("r2", "b", "c"), ("r3", "c", "d")] {
            backend
                .insert_relationship(&ContextRelationship {
                    id: id.into(),
                    source_id: src.into(),
                    target_id: dst.into(),
                    relationship_type: "references".into(),
                    weight: 0.5,
                    created_at: now,
                    metadata: json!({}),
                })
                .await
                .unwrap();
        }

        let removed = backend.delete_relationships_touching(&["b".to_string()]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.all_relationships().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_more_ids_than_parameter_limit() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.insert_memory(&entry("keep", MemoryKind::Change, 10, vec![])).await.unwrap();
        backend.insert_memory(&entry("m_7", MemoryKind::Change, 10, vec![])).await.unwrap();
        backend.insert_memory(&entry("m_39999", MemoryKind::Change, 10, vec![])).await.unwrap();

        let ids: Vec<String> = (0..40_000).map(|i| format!("m_{}", i)).collect();
        assert_eq!(backend.delete_memories(&ids).await.unwrap(), 2);
        assert_eq!(backend.delete_relationships_touching(&ids).await.unwrap(), 0);
        assert!(backend.get_memory("keep").await.unwrap().is_some());
        assert!(backend.get_memory("m_39999").await.unwrap().is_none());
    }
}
