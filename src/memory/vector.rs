//! Vector-native backend
//!
//! Three collections of `{id, embedding, document, metadata}` records, each persisted
//! as one JSON file. Nearest-neighbour queries go to HNSW indexes (one per memory
//! kind, one for code patterns) that are rebuilt from the records on open and
//! report cosine distance.

use super::backend::{MemoryBackend, Neighbor, Proximity, sort_entry_neighbors, sort_newest_first, sort_pattern_neighbors};
use super::hnsw::VectorIndex;
use super::sqlite::{format_timestamp, parse_timestamp};
use super::types::{CodePattern, ContextRelationship, MemoryEntry, MemoryFilter, MemoryKind};
use crate::config::StorageBackendKind;
use crate::error::{CodectxError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::debug;

const MEMORIES: &str = "memories";
const CODE_PATTERNS: &str = "code_patterns";
const RELATIONSHIPS: &str = "relationships";

/// A record in a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub document: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Record {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    fn meta_f32(&self, key: &str) -> Option<f32> {
        self.metadata.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.meta_str(key).ok_or_else(|| {
            CodectxError::Storage(format!("record {} is missing '{}'", self.id, key))
        })
    }

    fn memory_kind(&self) -> Option<MemoryKind> {
        self.meta_str("kind").and_then(|k| k.parse().ok())
    }
}

/// One named collection and the file backing it.
struct Collection {
    path: PathBuf,
    records: Vec<Record>,
}

impl Collection {
    fn load(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.json", name));
        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    /// Write to a sibling temp file, then rename over the collection file.
    fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            serde_json::to_writer(&mut writer, &self.records)?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Append `record` and persist; the record is dropped again if the write fails.
    fn push(&mut self, record: Record) -> Result<()> {
        self.records.push(record);
        if let Err(e) = self.save() {
            self.records.pop();
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn delete_where<F>(&mut self, predicate: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        let (removed, kept) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| predicate(r));
        self.records = kept;
        removed
    }
}

struct Collections {
    memories: Collection,
    code_patterns: Collection,
    relationships: Collection,
    memory_index: HashMap<MemoryKind, Arc<VectorIndex>>,
    pattern_index: Arc<VectorIndex>,
}

impl Collections {
    fn build_memory_index(memories: &Collection, kind: MemoryKind) -> Result<Arc<VectorIndex>> {
        let items = memories
            .records
            .iter()
            .filter(|r| r.memory_kind() == Some(kind))
            .map(|r| (r.id.as_str(), r.embedding.as_slice()));
        Ok(Arc::new(VectorIndex::build(items)?))
    }

    fn memory_index(&self, kind: MemoryKind) -> Result<&Arc<VectorIndex>> {
        self.memory_index
            .get(&kind)
            .ok_or_else(|| CodectxError::Storage(format!("no vector index for {}", kind)))
    }
}

pub struct VectorBackend {
    collections: Mutex<Collections>,
}

impl VectorBackend {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let memories = Collection::load(dir, MEMORIES)?;
        let code_patterns = Collection::load(dir, CODE_PATTERNS)?;
        let relationships = Collection::load(dir, RELATIONSHIPS)?;

        let mut memory_index = HashMap::new();
        for kind in MemoryKind::ALL {
            memory_index.insert(kind, Collections::build_memory_index(&memories, kind)?);
        }
        let pattern_index = Arc::new(VectorIndex::build(
            code_patterns
                .records
                .iter()
                .map(|r| (r.id.as_str(), r.embedding.as_slice())),
        )?);

        debug!(
            path = %dir.display(),
            memories = memories.records.len(),
            patterns = code_patterns.records.len(),
            indexed_patterns = pattern_index.len(),
            "Opened vector memory store"
        );

        Ok(Self {
            collections: Mutex::new(Collections {
                memories,
                code_patterns,
                relationships,
                memory_index,
                pattern_index,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Collections>> {
        self.collections.lock().map_err(CodectxError::poisoned)
    }
}

/// Query every index off the async runtime and pool the hits.
async fn search_indexes(
    indexes: Vec<Arc<VectorIndex>>,
    query: &[f32],
    limit: usize,
) -> Result<Vec<(String, f32)>> {
    let query = query.to_vec();
    tokio::task::spawn_blocking(move || -> Result<Vec<(String, f32)>> {
        let mut hits = Vec::new();
        for index in &indexes {
            hits.extend(index.search(&query, limit)?);
        }
        Ok(hits)
    })
    .await
    .map_err(|e| CodectxError::Storage(format!("vector search task failed: {}", e)))?
}

fn memory_to_record(entry: &MemoryEntry) -> Result<Record> {
    let mut metadata = Map::new();
    metadata.insert("kind".into(), json!(entry.kind.as_str()));
    metadata.insert("created_at".into(), json!(format_timestamp(&entry.created_at)));
    if let Some(path) = &entry.file_path {
        metadata.insert("file_path".into(), json!(path));
    }
    metadata.insert("tags".into(), json!(serde_json::to_string(&entry.tags)?));
    metadata.insert("semantic_score".into(), json!(entry.semantic_score));
    metadata.insert("access_count".into(), json!(entry.access_count));
    if let Some(t) = &entry.last_accessed {
        metadata.insert("last_accessed".into(), json!(format_timestamp(t)));
    }

    Ok(Record {
        id: entry.id.clone(),
        embedding: entry.embedding.clone(),
        document: serde_json::to_string(&entry.content)?,
        metadata,
    })
}

fn record_to_memory(record: &Record) -> Result<MemoryEntry> {
    Ok(MemoryEntry {
        id: record.id.clone(),
        kind: record.required("kind")?.parse()?,
        content: serde_json::from_str(&record.document)?,
        created_at: parse_timestamp(record.required("created_at")?)?,
        file_path: record.meta_str("file_path").map(str::to_string),
        tags: match record.meta_str("tags") {
            Some(tags) => serde_json::from_str(tags)?,
            None => Vec::new(),
        },
        embedding: record.embedding.clone(),
        semantic_score: record.meta_f32("semantic_score").unwrap_or(1.0),
        access_count: record
            .metadata
            .get("access_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        last_accessed: record.meta_str("last_accessed").map(parse_timestamp).transpose()?,
    })
}

fn pattern_to_record(pattern: &CodePattern) -> Result<Record> {
    let mut metadata = Map::new();
    metadata.insert("fingerprint".into(), json!(pattern.fingerprint));
    metadata.insert("pattern_type".into(), json!(pattern.pattern_type));
    metadata.insert("usage_count".into(), json!(pattern.usage_count));
    metadata.insert("created_at".into(), json!(format_timestamp(&pattern.created_at)));
    metadata.insert("last_used".into(), json!(format_timestamp(&pattern.last_used)));
    metadata.insert("context".into(), json!(serde_json::to_string(&pattern.context)?));

    Ok(Record {
        id: pattern.id.clone(),
        embedding: pattern.embedding.clone(),
        document: pattern.content.clone(),
        metadata,
    })
}

fn record_to_pattern(record: &Record) -> Result<CodePattern> {
    Ok(CodePattern {
        id: record.id.clone(),
        fingerprint: record.required("fingerprint")?.to_string(),
        pattern_type: record.required("pattern_type")?.to_string(),
        content: record.document.clone(),
        usage_count: record
            .metadata
            .get("usage_count")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32,
        created_at: parse_timestamp(record.required("created_at")?)?,
        last_used: parse_timestamp(record.required("last_used")?)?,
        context: match record.meta_str("context") {
            Some(ctx) => serde_json::from_str(ctx)?,
            None => json!({}),
        },
        embedding: record.embedding.clone(),
    })
}

fn relationship_to_record(rel: &ContextRelationship) -> Result<Record> {
    let mut metadata = Map::new();
    metadata.insert("source_id".into(), json!(rel.source_id));
    metadata.insert("target_id".into(), json!(rel.target_id));
    metadata.insert("relationship_type".into(), json!(rel.relationship_type));
    metadata.insert("weight".into(), json!(rel.weight));
    metadata.insert("created_at".into(), json!(format_timestamp(&rel.created_at)));

    Ok(Record {
        id: rel.id.clone(),
        embedding: Vec::new(),
        document: serde_json::to_string(&rel.metadata)?,
        metadata,
    })
}

fn record_to_relationship(record: &Record) -> Result<ContextRelationship> {
    Ok(ContextRelationship {
        id: record.id.clone(),
        source_id: record.required("source_id")?.to_string(),
        target_id: record.required("target_id")?.to_string(),
        relationship_type: record.required("relationship_type")?.to_string(),
        weight: record.meta_f32("weight").unwrap_or(0.0),
        created_at: parse_timestamp(record.required("created_at")?)?,
        metadata: serde_json::from_str(&record.document)?,
    })
}

#[async_trait]
impl MemoryBackend for VectorBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Vector
    }

    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let record = memory_to_record(entry)?;
        let mut collections = self.lock()?;
        if collections.memories.get(&record.id).is_some() {
            return Err(CodectxError::Storage(format!("memory {} already exists", record.id)));
        }
        collections.memories.push(record)?;
        collections
            .memory_index(entry.kind)?
            .insert(&entry.id, &entry.embedding)?;
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let collections = self.lock()?;
        collections.memories.get(id).map(record_to_memory).transpose()
    }

    async fn update_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let mut collections = self.lock()?;
        let record = collections
            .memories
            .get_mut(&entry.id)
            .ok_or_else(|| CodectxError::Storage(format!("memory {} not found", entry.id)))?;

        record.metadata.insert("semantic_score".into(), json!(entry.semantic_score));
        record.metadata.insert("access_count".into(), json!(entry.access_count));
        if let Some(t) = &entry.last_accessed {
            record.metadata.insert("last_accessed".into(), json!(format_timestamp(t)));
        }
        collections.memories.save()
    }

    async fn query_memories(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let collections = self.lock()?;
        let mut entries = Vec::new();
        for record in &collections.memories.records {
            let entry = record_to_memory(record)?;
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }

        sort_newest_first(&mut entries);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        kinds: &[MemoryKind],
        limit: usize,
    ) -> Result<Vec<Neighbor<MemoryEntry>>> {
        let kinds: &[MemoryKind] = if kinds.is_empty() { &MemoryKind::ALL } else { kinds };
        let indexes = {
            let collections = self.lock()?;
            kinds
                .iter()
                .map(|kind| collections.memory_index(*kind).cloned())
                .collect::<Result<Vec<_>>>()?
        };

        let hits = search_indexes(indexes, query, limit).await?;

        let collections = self.lock()?;
        let mut neighbors = Vec::new();
        for (id, distance) in hits {
            // deleted between the search and this lookup
            let Some(record) = collections.memories.get(&id) else {
                continue;
            };
            neighbors.push(Neighbor {
                item: record_to_memory(record)?,
                proximity: Proximity::Distance(distance),
            });
        }

        sort_entry_neighbors(&mut neighbors);
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    async fn delete_memories(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut collections = self.lock()?;
        let removed = collections.memories.delete_where(|r| ids.contains(&r.id));
        if removed.is_empty() {
            return Ok(0);
        }
        collections.memories.save()?;

        for record in &removed {
            if let Some(kind) = record.memory_kind() {
                collections.memory_index(kind)?.remove(&record.id)?;
            }
        }
        for kind in MemoryKind::ALL {
            if collections.memory_index(kind)?.needs_rebuild() {
                let rebuilt = Collections::build_memory_index(&collections.memories, kind)?;
                debug!(kind = %kind, live = rebuilt.len(), "Rebuilt vector index");
                collections.memory_index.insert(kind, rebuilt);
            }
        }
        Ok(removed.len())
    }

    async fn find_pattern(&self, fingerprint: &str) -> Result<Option<CodePattern>> {
        let collections = self.lock()?;
        collections
            .code_patterns
            .records
            .iter()
            .find(|r| r.meta_str("fingerprint") == Some(fingerprint))
            .map(record_to_pattern)
            .transpose()
    }

    async fn insert_pattern(&self, pattern: &CodePattern) -> Result<()> {
        let record = pattern_to_record(pattern)?;
        let mut collections = self.lock()?;
        let duplicate = collections
            .code_patterns
            .records
            .iter()
            .any(|r| r.meta_str("fingerprint") == Some(pattern.fingerprint.as_str()));
        if duplicate {
            return Err(CodectxError::Storage(format!(
                "pattern with fingerprint {} already exists",
                pattern.fingerprint
            )));
        }
        collections.code_patterns.push(record)?;
        collections.pattern_index.insert(&pattern.id, &pattern.embedding)?;
        Ok(())
    }

    async fn update_pattern(&self, pattern: &CodePattern) -> Result<()> {
        let mut collections = self.lock()?;
        let record = collections
            .code_patterns
            .get_mut(&pattern.id)
            .ok_or_else(|| CodectxError::Storage(format!("pattern {} not found", pattern.id)))?;

        record.metadata.insert("usage_count".into(), json!(pattern.usage_count));
        record
            .metadata
            .insert("last_used".into(), json!(format_timestamp(&pattern.last_used)));
        collections.code_patterns.save()
    }

    async fn pattern_search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<Neighbor<CodePattern>>> {
        let index = Arc::clone(&self.lock()?.pattern_index);
        let hits = search_indexes(vec![index], query, limit).await?;

        let collections = self.lock()?;
        let mut neighbors = Vec::new();
        for (id, distance) in hits {
            let Some(record) = collections.code_patterns.get(&id) else {
                continue;
            };
            neighbors.push(Neighbor {
                item: record_to_pattern(record)?,
                proximity: Proximity::Distance(distance),
            });
        }

        sort_pattern_neighbors(&mut neighbors);
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    async fn all_patterns(&self) -> Result<Vec<CodePattern>> {
        let collections = self.lock()?;
        collections.code_patterns.records.iter().map(record_to_pattern).collect()
    }

    async fn insert_relationship(&self, relationship: &ContextRelationship) -> Result<()> {
        let record = relationship_to_record(relationship)?;
        let mut collections = self.lock()?;
        collections.relationships.push(record)
    }

    async fn relationships_from(
        &self,
        source_id: &str,
        relationship_type: Option<&str>,
    ) -> Result<Vec<ContextRelationship>> {
        let collections = self.lock()?;
        let mut edges = Vec::new();
        for record in &collections.relationships.records {
            if record.meta_str("source_id") != Some(source_id) {
                continue;
            }
            if relationship_type.is_some_and(|t| record.meta_str("relationship_type") != Some(t)) {
                continue;
            }
            edges.push(record_to_relationship(record)?);
        }

        edges.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(edges)
    }

    async fn all_relationships(&self) -> Result<Vec<ContextRelationship>> {
        let collections = self.lock()?;
        collections
            .relationships
            .records
            .iter()
            .map(record_to_relationship)
            .collect()
    }

    async fn delete_relationships_touching(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut collections = self.lock()?;
        let touches = |r: &Record| {
            [r.meta_str("source_id"), r.meta_str("target_id")]
                .into_iter()
                .flatten()
                .any(|id| ids.iter().any(|d| d == id))
        };
        let removed = collections.relationships.delete_where(touches);
        if !removed.is_empty() {
            collections.relationships.save()?;
        }
        Ok(removed.len())
    }

    async fn count_memories(&self, kind: MemoryKind) -> Result<usize> {
        let collections = self.lock()?;
        Ok(collections
            .memories
            .records
            .iter()
            .filter(|r| r.memory_kind() == Some(kind))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(id: &str, embedding: Vec<f32>) -> MemoryEntry {
        let mut e = MemoryEntry::new(
            id.to_string(),
            MemoryKind::Context,
            json!({ "file": id }),
            Utc::now(),
        );
        e.file_path = Some(format!("{}.py", id));
        e.tags = vec!["code".into(), "context".into()];
        e.embedding = embedding;
        e
    }

    #[tokio::test]
    async fn test_records_and_index_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = VectorBackend::open(dir.path()).unwrap();
            backend.insert_memory(&entry("a", vec![1.0, 0.0])).await.unwrap();
            backend.insert_memory(&entry("b", vec![0.0, 1.0])).await.unwrap();
        }

        assert!(dir.path().join("memories.json").exists());
        let reopened = VectorBackend::open(dir.path()).unwrap();
        let loaded = reopened.get_memory("a").await.unwrap().unwrap();
        assert_eq!(loaded.file_path.as_deref(), Some("a.py"));
        assert_eq!(loaded.tags, vec!["code".to_string(), "context".to_string()]);
        assert_eq!(loaded.embedding, vec![1.0, 0.0]);

        let hits = reopened.vector_search(&[0.0, 1.0], &[], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.id, "b");
    }

    #[tokio::test]
    async fn test_query_reports_distance() {
        let dir = TempDir::new().unwrap();
        let backend = VectorBackend::open(dir.path()).unwrap();
        backend.insert_memory(&entry("same", vec![1.0, 0.0])).await.unwrap();
        backend.insert_memory(&entry("orthogonal", vec![0.0, 1.0])).await.unwrap();

        let hits = backend.vector_search(&[1.0, 0.0], &[MemoryKind::Context], 5).await.unwrap();
        assert_eq!(hits[0].item.id, "same");
        assert!(matches!(hits[0].proximity, Proximity::Distance(d) if d.abs() < 1e-5));
        assert!(matches!(hits[1].proximity, Proximity::Distance(d) if (d - 1.0).abs() < 1e-5));

        let none = backend.vector_search(&[1.0, 0.0], &[MemoryKind::Change], 5).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_unscored_entries_stay_out_of_search() {
        let dir = TempDir::new().unwrap();
        let backend = VectorBackend::open(dir.path()).unwrap();
        backend.insert_memory(&entry("zero", vec![0.0, 0.0])).await.unwrap();
        backend.insert_memory(&entry("unit", vec![0.6, 0.8])).await.unwrap();

        let hits = backend.vector_search(&[0.6, 0.8], &[], 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|n| n.item.id.as_str()).collect();
        assert_eq!(ids, vec!["unit"]);
        assert!(backend.get_memory("zero").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleted_memories_leave_the_index() {
        let dir = TempDir::new().unwrap();
        let backend = VectorBackend::open(dir.path()).unwrap();
        for i in 0..12 {
            let angle = i as f32 * 0.1;
            backend
                .insert_memory(&entry(&format!("m{}", i), vec![angle.cos(), angle.sin()]))
                .await
                .unwrap();
        }

        let doomed: Vec<String> = (0..4).map(|i| format!("m{}", i)).collect();
        assert_eq!(backend.delete_memories(&doomed).await.unwrap(), 4);

        let hits = backend.vector_search(&[1.0, 0.0], &[], 20).await.unwrap();
        assert_eq!(hits.len(), 8);
        assert!(hits.iter().all(|n| !doomed.contains(&n.item.id)));
        assert_eq!(hits[0].item.id, "m4");
    }

    #[tokio::test]
    async fn test_saves_leave_only_collection_files() {
        let dir = TempDir::new().unwrap();
        let backend = VectorBackend::open(dir.path()).unwrap();
        backend.insert_memory(&entry("a", vec![1.0, 0.0])).await.unwrap();
        backend.insert_memory(&entry("b", vec![0.0, 1.0])).await.unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["memories.json"]);

        let on_disk: Vec<Record> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("memories.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn test_update_memory_rewrites_metadata() {
        let dir = TempDir::new().unwrap();
        let backend = VectorBackend::open(dir.path()).unwrap();
        let mut e = entry("a", vec![]);
        backend.insert_memory(&e).await.unwrap();

        e.semantic_score = 2.5;
        e.access_count = 3;
        e.last_accessed = Some(Utc::now());
        backend.update_memory(&e).await.unwrap();

        let loaded = backend.get_memory("a").await.unwrap().unwrap();
        assert_eq!(loaded.semantic_score, 2.5);
        assert_eq!(loaded.access_count, 3);
        assert!(loaded.last_accessed.is_some());
    }
}
