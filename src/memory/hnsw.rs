//! Approximate nearest-neighbour index over one vector collection.
//!
//! A thin layer over `hnsw_rs` that maps record ids to graph slots. The graph
//! cannot drop points, so removals are soft: the slot is marked stale and
//! filtered out of results until the owner rebuilds from its records.

use crate::embedding::is_zero;
use crate::error::{CodectxError, Result};
use hnsw_rs::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const MAX_NB_CONNECTION: usize = 24;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;
const MAX_ELEMENTS: usize = 100_000;

/// Stale share of slots above which a rebuild is due.
const REBUILD_RATIO: f64 = 0.10;

struct Graph {
    hnsw: Hnsw<'static, f32, DistCosine>,
}

// SAFETY: the graph owns all of its point data (it is never loaded from a
// memory-mapped dump) and guards its layers with internal locks.
unsafe impl Send for Graph {}
unsafe impl Sync for Graph {}

#[derive(Default)]
struct Slots {
    /// Graph data id -> record id.
    ids: Vec<String>,
    live: HashMap<String, usize>,
    stale: HashSet<usize>,
    dimension: Option<usize>,
}

pub struct VectorIndex {
    graph: Graph,
    slots: RwLock<Slots>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        let hnsw = Hnsw::<f32, DistCosine>::new(
            MAX_NB_CONNECTION,
            MAX_ELEMENTS,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine,
        );
        Self {
            graph: Graph { hnsw },
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Fresh index holding every indexable `(id, embedding)` pair.
    pub fn build<'a, I>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [f32])>,
    {
        let index = Self::new();
        for (id, embedding) in items {
            index.insert(id, embedding)?;
        }
        Ok(index)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Slots>> {
        self.slots.read().map_err(CodectxError::poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Slots>> {
        self.slots.write().map_err(CodectxError::poisoned)
    }

    /// Add or replace the vector for `id`.
    ///
    /// Empty and all-zero vectors are not indexed, nor are vectors whose length
    /// differs from the first one indexed. Returns whether the vector went in.
    pub fn insert(&self, id: &str, embedding: &[f32]) -> Result<bool> {
        if embedding.is_empty() || is_zero(embedding) {
            return Ok(false);
        }

        let mut slots = self.write()?;
        match slots.dimension {
            Some(dimension) if dimension != embedding.len() => return Ok(false),
            Some(_) => {}
            None => slots.dimension = Some(embedding.len()),
        }

        if let Some(old) = slots.live.remove(id) {
            slots.stale.insert(old);
        }
        let slot = slots.ids.len();
        self.graph.hnsw.insert_slice((embedding, slot));
        slots.ids.push(id.to_string());
        slots.live.insert(id.to_string(), slot);
        Ok(true)
    }

    /// Soft-delete `id`. Returns whether it was indexed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut slots = self.write()?;
        match slots.live.remove(id) {
            Some(slot) => {
                slots.stale.insert(slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Up to `k` live ids nearest to `query` with their cosine distance, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let slots = self.read()?;
        if k == 0 || slots.live.is_empty() || is_zero(query) || slots.dimension != Some(query.len()) {
            return Ok(Vec::new());
        }

        let request = (k + slots.stale.len()).min(slots.ids.len());
        let ef = EF_SEARCH.max(request * 2);
        let mut hits: Vec<(String, f32)> = self
            .graph
            .hnsw
            .search(query, request, ef)
            .into_iter()
            .filter(|n| !slots.stale.contains(&n.d_id))
            .filter_map(|n| slots.ids.get(n.d_id).map(|id| (id.clone(), n.distance.max(0.0))))
            .collect();

        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.read().map(|s| s.live.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn needs_rebuild(&self) -> bool {
        self.read()
            .map(|s| !s.ids.is_empty() && s.stale.len() as f64 / s.ids.len() as f64 > REBUILD_RATIO)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize;

    fn vector(dim: usize, seed: usize) -> Vec<f32> {
        normalize(
            (0..dim)
                .map(|i| ((seed * 7 + i * 13) % 1000) as f32 / 1000.0)
                .collect(),
        )
    }

    #[test]
    fn test_nearest_neighbour_is_exact_match() {
        let index = VectorIndex::new();
        for i in 0..60 {
            index.insert(&format!("m{}", i), &vector(32, i)).unwrap();
        }

        let hits = index.search(&vector(32, 42), 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, "m42");
        assert!(hits[0].1 < 0.01);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_removed_ids_are_filtered() {
        let index = VectorIndex::new();
        for i in 0..10 {
            index.insert(&format!("m{}", i), &vector(16, i)).unwrap();
        }

        assert!(index.remove("m5").unwrap());
        assert!(!index.remove("m5").unwrap());

        let hits = index.search(&vector(16, 5), 10).unwrap();
        assert_eq!(hits.len(), 9);
        assert!(hits.iter().all(|(id, _)| id != "m5"));
        assert_eq!(index.len(), 9);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let index = VectorIndex::new();
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0]).unwrap();
        index.insert("a", &[0.0, 1.0]).unwrap();

        let hits = index.search(&[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(_, d)| *d < 1e-5));
    }

    #[test]
    fn test_unindexable_vectors_are_skipped() {
        let index = VectorIndex::new();
        assert!(!index.insert("empty", &[]).unwrap());
        assert!(!index.insert("zero", &[0.0, 0.0]).unwrap());
        assert!(index.insert("a", &[1.0, 0.0]).unwrap());
        assert!(!index.insert("wide", &[1.0, 0.0, 0.0]).unwrap());

        assert_eq!(index.len(), 1);
        assert!(index.search(&[0.0, 0.0], 5).unwrap().is_empty());
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_threshold() {
        let index = VectorIndex::new();
        for i in 0..20 {
            index.insert(&format!("m{}", i), &vector(8, i)).unwrap();
        }
        index.remove("m0").unwrap();
        index.remove("m1").unwrap();
        assert!(!index.needs_rebuild());

        index.remove("m2").unwrap();
        assert!(index.needs_rebuild());
    }

    #[test]
    fn test_empty_index_search() {
        let index = VectorIndex::new();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }
}
