//! Storage capability shared by every memory backend

use super::types::{CodePattern, ContextRelationship, MemoryEntry, MemoryFilter, MemoryKind};
use crate::config::StorageBackendKind;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// How close a neighbour is, in whatever metric the backend natively reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proximity {
    Similarity(f32),
    Distance(f32),
}

impl Proximity {
    pub fn similarity(&self) -> f32 {
        match *self {
            Proximity::Similarity(s) => s,
            Proximity::Distance(d) => 1.0 - d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Neighbor<T> {
    pub item: T,
    pub proximity: Proximity,
}

/// Persistence for memories, code patterns and relationships.
///
/// Entries with an all-zero embedding are never returned from the vector searches.
/// `query_memories` returns newest first.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn kind(&self) -> StorageBackendKind;

    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<()>;

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryEntry>>;

    /// Persist the mutable fields (score, access count, last access) of an existing entry.
    async fn update_memory(&self, entry: &MemoryEntry) -> Result<()>;

    async fn query_memories(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>>;

    async fn vector_search(
        &self,
        query: &[f32],
        kinds: &[MemoryKind],
        limit: usize,
    ) -> Result<Vec<Neighbor<MemoryEntry>>>;

    /// Returns the number of entries removed.
    async fn delete_memories(&self, ids: &[String]) -> Result<usize>;

    async fn find_pattern(&self, fingerprint: &str) -> Result<Option<CodePattern>>;

    async fn insert_pattern(&self, pattern: &CodePattern) -> Result<()>;

    /// Persist usage count and last use of an existing pattern.
    async fn update_pattern(&self, pattern: &CodePattern) -> Result<()>;

    async fn pattern_search(&self, query: &[f32], limit: usize)
    -> Result<Vec<Neighbor<CodePattern>>>;

    async fn all_patterns(&self) -> Result<Vec<CodePattern>>;

    async fn insert_relationship(&self, relationship: &ContextRelationship) -> Result<()>;

    async fn relationships_from(
        &self,
        source_id: &str,
        relationship_type: Option<&str>,
    ) -> Result<Vec<ContextRelationship>>;

    async fn all_relationships(&self) -> Result<Vec<ContextRelationship>>;

    /// Remove edges whose source or target is in `ids`.
    async fn delete_relationships_touching(&self, ids: &[String]) -> Result<usize>;

    async fn count_memories(&self, kind: MemoryKind) -> Result<usize>;
}

/// Ranking used everywhere: similarity desc, then newest, then id.
pub fn rank_order(
    a: (f32, &DateTime<Utc>, &str),
    b: (f32, &DateTime<Utc>, &str),
) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.1.cmp(a.1))
        .then_with(|| a.2.cmp(b.2))
}

pub fn sort_entry_neighbors(neighbors: &mut [Neighbor<MemoryEntry>]) {
    neighbors.sort_by(|a, b| {
        rank_order(
            (a.proximity.similarity(), &a.item.created_at, &a.item.id),
            (b.proximity.similarity(), &b.item.created_at, &b.item.id),
        )
    });
}

pub fn sort_pattern_neighbors(neighbors: &mut [Neighbor<CodePattern>]) {
    neighbors.sort_by(|a, b| {
        rank_order(
            (a.proximity.similarity(), &a.item.last_used, &a.item.id),
            (b.proximity.similarity(), &b.item.last_used, &b.item.id),
        )
    });
}

/// Newest first, id as tie-break.
pub fn sort_newest_first(entries: &mut [MemoryEntry]) {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_distance_converts_to_similarity() {
        assert_eq!(Proximity::Distance(0.25).similarity(), 0.75);
        assert_eq!(Proximity::Similarity(0.4).similarity(), 0.4);
        assert_eq!(Proximity::Distance(1.5).similarity(), -0.5);
    }

    #[test]
    fn test_rank_order_tie_breaks() {
        let now = Utc::now();
        let older = now - Duration::seconds(5);

        assert_eq!(rank_order((0.9, &now, "b"), (0.5, &now, "a")), Ordering::Less);
        assert_eq!(rank_order((0.5, &now, "b"), (0.5, &older, "a")), Ordering::Less);
        assert_eq!(rank_order((0.5, &now, "a"), (0.5, &now, "b")), Ordering::Less);
    }
}
