//! Similarity index
//!
//! [`SimilarityIndex`] owns the [`VectorStore`] and the search structure over
//! it. Two strategies share one contract:
//!
//! - [`SearchStrategy::Flat`]: exhaustive exact scan (default). Large stores
//!   are scanned in parallel chunks with rayon.
//! - [`SearchStrategy::Hnsw`]: graph search; the candidates it returns carry
//!   exact distances and are ranked the same way as the flat scan.
//!
//! Distances are squared Euclidean (L2²) over the raw vectors. Results are
//! ascending by distance, ties broken by the lower insertion position.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hnsw::Hnsw;
use crate::simd::l2_distance_squared;
use crate::store::VectorStore;

/// Below this many vectors the flat scan stays on the calling thread
const PARALLEL_SCAN_THRESHOLD: usize = 16_384;
const PARALLEL_CHUNK: usize = 4_096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Identifier must not be empty")]
    EmptyIdentifier,

    #[error("Position out of range: {position} >= {size}")]
    OutOfRange { position: usize, size: usize },

    #[error("Vector component {component} is not finite")]
    NonFiniteComponent { component: usize },
}

/// Search structure kept alongside the vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Exact exhaustive scan
    #[default]
    Flat,
    /// Approximate HNSW graph
    Hnsw,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Flat => "flat",
            SearchStrategy::Hnsw => "hnsw",
        }
    }
}

impl std::str::FromStr for SearchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(SearchStrategy::Flat),
            "hnsw" => Ok(SearchStrategy::Hnsw),
            other => Err(format!("unknown search strategy '{}' (expected flat or hnsw)", other)),
        }
    }
}

impl std::fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub dim: usize,
    pub strategy: SearchStrategy,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    pub seed: u64,
}

impl IndexParams {
    /// Flat index of dimension `dim` with default HNSW knobs
    pub fn flat(dim: usize) -> Self {
        Self {
            dim,
            strategy: SearchStrategy::Flat,
            hnsw_m: 16,
            hnsw_ef_construction: 100,
            hnsw_ef_search: 64,
            seed: 0x5eed,
        }
    }

    /// HNSW index of dimension `dim` with default knobs
    pub fn hnsw(dim: usize) -> Self {
        Self {
            strategy: SearchStrategy::Hnsw,
            ..Self::flat(dim)
        }
    }
}

/// One search hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Insertion position
    pub position: usize,
    /// Squared L2 distance to the query
    pub distance: f32,
}

impl Neighbor {
    #[inline]
    fn rank(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.position.cmp(&other.position))
    }
}

/// Max-heap wrapper: worst kept hit on top
struct Worst(Neighbor);

impl PartialEq for Worst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Worst {}

impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank(&other.0)
    }
}

impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub vectors: usize,
    pub dim: usize,
    pub strategy: SearchStrategy,
    pub memory_bytes: usize,
    /// Layers in the HNSW graph (0 for flat)
    pub graph_layers: usize,
    /// Directed edges in the HNSW graph (0 for flat)
    pub graph_edges: usize,
}

/// Vectors plus the structure that searches them
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    params: IndexParams,
    store: VectorStore,
    graph: Option<Hnsw>,
}

impl SimilarityIndex {
    pub fn new(params: IndexParams) -> Self {
        let graph = match params.strategy {
            SearchStrategy::Flat => None,
            SearchStrategy::Hnsw => Some(Hnsw::new(
                params.hnsw_m,
                params.hnsw_ef_construction,
                params.seed,
            )),
        };
        Self {
            store: VectorStore::new(params.dim),
            params,
            graph,
        }
    }

    /// Assemble an index from restored parts.
    ///
    /// An HNSW index restored without a graph (or with one that does not cover
    /// the store) has its graph rebuilt from the vectors.
    pub fn from_parts(params: IndexParams, store: VectorStore, graph: Option<Hnsw>) -> Self {
        let graph = match params.strategy {
            SearchStrategy::Flat => None,
            SearchStrategy::Hnsw => match graph {
                Some(g) if g.validate(store.size()).is_ok() => Some(g),
                _ => {
                    tracing::info!(vectors = store.size(), "rebuilding HNSW graph from vectors");
                    let mut g = Hnsw::new(params.hnsw_m, params.hnsw_ef_construction, params.seed);
                    for position in 0..store.size() {
                        g.insert(position, &store);
                    }
                    Some(g)
                }
            },
        };
        Self {
            params,
            store,
            graph,
        }
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    pub fn strategy(&self) -> SearchStrategy {
        self.params.strategy
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn graph(&self) -> Option<&Hnsw> {
        self.graph.as_ref()
    }

    /// Number of indexed vectors; always equal to `store().size()`
    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn identifier(&self, position: usize) -> Result<&str, IndexError> {
        self.store.get_identifier(position)
    }

    /// Check an insertion without applying it
    pub fn validate(&self, vector: &[f32], identifier: &str) -> Result<(), IndexError> {
        self.store.validate(vector, identifier)
    }

    /// Register `vector` under `identifier`, returning its position.
    ///
    /// Either the store and the search structure both take the record, or the
    /// call fails before either changes.
    pub fn insert(&mut self, vector: &[f32], identifier: &str) -> Result<usize, IndexError> {
        let position = self.store.append(vector, identifier)?;
        if let Some(graph) = self.graph.as_mut() {
            graph.insert(position, &self.store);
        }
        debug_assert!(self.graph.as_ref().map_or(true, |g| g.len() == self.store.size()));
        Ok(position)
    }

    /// Up to `k` nearest stored vectors to `query`.
    ///
    /// Empty index or `k == 0` yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.store.validate_vector(query)?;
        if k == 0 || self.store.is_empty() {
            return Ok(Vec::new());
        }

        let hits = match &self.graph {
            Some(graph) => {
                let ef = self.params.hnsw_ef_search.max(k);
                let mut hits: Vec<Neighbor> = graph
                    .search(query, k, ef, &self.store)
                    .into_iter()
                    .map(|(position, distance)| Neighbor { position, distance })
                    .collect();
                hits.sort_by(|a, b| a.rank(b));
                hits
            }
            None => self.scan(query, k),
        };
        Ok(hits)
    }

    /// Exact top-k over every stored vector
    fn scan(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let count = self.store.size();
        if count < PARALLEL_SCAN_THRESHOLD {
            return top_k(query, &self.store, 0..count, k);
        }

        let chunks: Vec<Vec<Neighbor>> = (0..count.div_ceil(PARALLEL_CHUNK))
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * PARALLEL_CHUNK;
                let end = (start + PARALLEL_CHUNK).min(count);
                top_k(query, &self.store, start..end, k)
            })
            .collect();

        let mut merged: Vec<Neighbor> = chunks.into_iter().flatten().collect();
        merged.sort_by(|a, b| a.rank(b));
        merged.truncate(k);
        merged
    }

    pub fn stats(&self) -> IndexStats {
        let (graph_layers, graph_edges) = match &self.graph {
            Some(g) => {
                let s = g.stats();
                (if s.num_nodes == 0 { 0 } else { s.max_layer + 1 }, s.total_edges)
            }
            None => (0, 0),
        };
        IndexStats {
            vectors: self.size(),
            dim: self.dim(),
            strategy: self.strategy(),
            memory_bytes: self.store.memory_bytes(),
            graph_layers,
            graph_edges,
        }
    }
}

fn top_k(
    query: &[f32],
    store: &VectorStore,
    positions: std::ops::Range<usize>,
    k: usize,
) -> Vec<Neighbor> {
    let mut heap: BinaryHeap<Worst> = BinaryHeap::with_capacity(k + 1);
    for position in positions {
        let hit = Neighbor {
            position,
            distance: l2_distance_squared(query, store.vector_unchecked(position)),
        };
        if heap.len() < k {
            heap.push(Worst(hit));
        } else if let Some(Worst(worst)) = heap.peek() {
            if hit.rank(worst) == Ordering::Less {
                heap.pop();
                heap.push(Worst(hit));
            }
        }
    }
    let mut out: Vec<Neighbor> = heap.into_iter().map(|Worst(n)| n).collect();
    out.sort_by(|a, b| a.rank(b));
    out
}
