//! HNSW construction and search
//!
//! - Random layer assignment (exponential distribution, seeded RNG)
//! - Diversity-preserving neighbor selection heuristic
//! - Beam search with pooled visited marks
//!
//! **Insert**: assign a random layer L, descend greedily from the entry point
//! to L + 1, then wire connections on every layer from min(L, top) down to 0.
//!
//! **Search**: greedy descent to layer 1, then a beam of `ef` candidates on
//! layer 0. Distances are exact L2² against the stored vectors, and every
//! ordering breaks ties on the lower position so results are reproducible.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::visited::Visited;
use crate::simd::l2_distance_squared;
use crate::store::VectorStore;

/// Upper bound on assigned layers; the codec stores a node's top layer in a u8.
const MAX_LAYER: usize = 32;

/// Scored node, ordered by (distance, id)
#[derive(Clone, Copy, Debug)]
struct Scored {
    id: usize,
    distance: f32,
}

impl Scored {
    #[inline]
    fn rank(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

/// Min-heap entry: closest candidate pops first
struct Nearest(Scored);

impl PartialEq for Nearest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Nearest {}

impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.rank(&self.0)
    }
}

impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry: worst kept result sits on top
struct Furthest(Scored);

impl PartialEq for Furthest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Furthest {}

impl Ord for Furthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank(&other.0)
    }
}

impl PartialOrd for Furthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Adjacency lists of one node, one list per layer it lives on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub layers: Vec<Vec<usize>>,
}

impl Node {
    fn new(top_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); top_layer + 1],
        }
    }

    /// Highest layer this node exists on
    pub fn top_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    /// Neighbors at `layer` (empty above the node's top layer)
    pub fn neighbors(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    fn link(&mut self, layer: usize, neighbor: usize) {
        if let Some(list) = self.layers.get_mut(layer) {
            if !list.contains(&neighbor) {
                list.push(neighbor);
            }
        }
    }
}

/// HNSW graph over the positions of a [`VectorStore`]
#[derive(Debug, Clone)]
pub struct Hnsw {
    /// `nodes[n]` is the node for store position `n`
    pub(crate) nodes: Vec<Node>,
    pub(crate) entry_point: Option<usize>,
    pub(crate) max_layer: usize,
    /// Max neighbors on layers ≥ 1
    pub(crate) m: usize,
    /// Max neighbors on layer 0
    pub(crate) m0: usize,
    /// Level multiplier (1 / ln M)
    ml: f64,
    pub(crate) ef_construction: usize,
    pub(crate) seed: u64,
    rng: StdRng,
}

impl Hnsw {
    /// Empty graph.
    ///
    /// - `m`: max neighbors per upper layer (clamped to ≥ 2; layer 0 keeps 2·M)
    /// - `ef_construction`: beam width while wiring new nodes
    /// - `seed`: layer-assignment RNG seed; equal seeds and insert order give equal graphs
    pub fn new(m: usize, ef_construction: usize, seed: u64) -> Self {
        let m = m.max(2);
        Self {
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: ef_construction.max(1),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reassemble a decoded graph
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        entry_point: Option<usize>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
        seed: u64,
    ) -> Self {
        let m = m.max(2);
        // continue the layer sequence instead of replaying it from the start
        let rng = StdRng::seed_from_u64(seed.wrapping_add(nodes.len() as u64));
        Self {
            nodes,
            entry_point,
            max_layer,
            m,
            m0: m0.max(1),
            ml: 1.0 / (m as f64).ln(),
            ef_construction: ef_construction.max(1),
            seed,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn entry_point(&self) -> Option<usize> {
        self.entry_point
    }

    fn random_layer(&mut self) -> usize {
        // gen() is in [0, 1); 1 - r keeps ln() finite
        let r: f64 = 1.0 - self.rng.gen::<f64>();
        ((-r.ln() * self.ml).floor() as usize).min(MAX_LAYER)
    }

    /// Wire store position `id` into the graph.
    ///
    /// `id` must be the next position (`id == len()`) and already present in
    /// `vectors`.
    pub fn insert(&mut self, id: usize, vectors: &VectorStore) {
        debug_assert_eq!(id, self.nodes.len(), "HNSW positions must be dense");
        let query = vectors.vector_unchecked(id);
        let node_layer = self.random_layer();
        let mut node = Node::new(node_layer);

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_layer = node_layer;
            self.nodes.push(node);
            return;
        };

        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(best) = self.search_layer(query, current, 1, layer, vectors).first() {
                current = best.id;
            }
        }

        // Plan every layer's links against the unchanged graph, then apply.
        let mut planned: Vec<(usize, Vec<Scored>)> = Vec::new();
        for layer in (0..=node_layer.min(self.max_layer)).rev() {
            let cap = self.layer_cap(layer);
            let candidates = self.search_layer(query, current, self.ef_construction, layer, vectors);
            if let Some(best) = candidates.first() {
                current = best.id;
            }
            planned.push((layer, select_neighbors(&candidates, cap, vectors)));
        }

        for (layer, neighbors) in &planned {
            for n in neighbors {
                node.link(*layer, n.id);
            }
        }
        self.nodes.push(node);

        for (layer, neighbors) in planned {
            let cap = self.layer_cap(layer);
            for n in neighbors {
                self.nodes[n.id].link(layer, id);
                if self.nodes[n.id].neighbors(layer).len() > cap {
                    self.prune(n.id, layer, cap, vectors);
                }
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(id);
        }
    }

    #[inline]
    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn prune(&mut self, id: usize, layer: usize, cap: usize, vectors: &VectorStore) {
        let base = vectors.vector_unchecked(id);
        let candidates: Vec<Scored> = self.nodes[id]
            .neighbors(layer)
            .iter()
            .map(|&n| Scored {
                id: n,
                distance: l2_distance_squared(base, vectors.vector_unchecked(n)),
            })
            .collect();
        let mut kept = select_neighbors(&candidates, cap, vectors);
        kept.sort_by(|a, b| a.rank(b));
        if let Some(list) = self.nodes[id].layers.get_mut(layer) {
            *list = kept.into_iter().map(|s| s.id).collect();
        }
    }

    /// Beam search on one layer, returning up to `ef` nodes sorted by (distance, id)
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        vectors: &VectorStore,
    ) -> Vec<Scored> {
        let mut visited = Visited::acquire(self.nodes.len());
        let mut frontier: BinaryHeap<Nearest> = BinaryHeap::with_capacity(ef);
        let mut kept: BinaryHeap<Furthest> = BinaryHeap::with_capacity(ef + 1);

        visited.insert(entry);
        let start = Scored {
            id: entry,
            distance: l2_distance_squared(query, vectors.vector_unchecked(entry)),
        };
        frontier.push(Nearest(start));
        kept.push(Furthest(start));

        while let Some(Nearest(current)) = frontier.pop() {
            if let Some(Furthest(worst)) = kept.peek() {
                if kept.len() >= ef && current.rank(worst) == Ordering::Greater {
                    break;
                }
            }

            for &neighbor in self.nodes[current.id].neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let candidate = Scored {
                    id: neighbor,
                    distance: l2_distance_squared(query, vectors.vector_unchecked(neighbor)),
                };
                let admit = kept.len() < ef
                    || kept
                        .peek()
                        .map(|Furthest(worst)| candidate.rank(worst) == Ordering::Less)
                        .unwrap_or(true);
                if admit {
                    frontier.push(Nearest(candidate));
                    kept.push(Furthest(candidate));
                    if kept.len() > ef {
                        kept.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = kept.into_iter().map(|Furthest(s)| s).collect();
        out.sort_by(|a, b| a.rank(b));
        out
    }

    /// Up to `k` nearest positions to `query` as (position, L2²), ascending,
    /// ties on the lower position. `ef` is raised to at least `k`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        vectors: &VectorStore,
    ) -> Vec<(usize, f32)> {
        let Some(mut current) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        for layer in (1..=self.max_layer).rev() {
            if let Some(best) = self.search_layer(query, current, 1, layer, vectors).first() {
                current = best.id;
            }
        }

        self.search_layer(query, current, ef.max(k), 0, vectors)
            .into_iter()
            .take(k)
            .map(|s| (s.id, s.distance))
            .collect()
    }

    /// Check that every id in the graph addresses one of `count` positions
    pub fn validate(&self, count: usize) -> Result<(), String> {
        if self.nodes.len() != count {
            return Err(format!(
                "graph has {} nodes for {} vectors",
                self.nodes.len(),
                count
            ));
        }
        match self.entry_point {
            Some(entry) if entry >= count => {
                return Err(format!("entry point {} out of bounds for {} vectors", entry, count));
            }
            None if count > 0 => return Err("non-empty graph without entry point".to_string()),
            _ => {}
        }
        for (id, node) in self.nodes.iter().enumerate() {
            for neighbors in &node.layers {
                if let Some(&bad) = neighbors.iter().find(|&&n| n >= count || n == id) {
                    return Err(format!("node {} links to invalid neighbor {}", id, bad));
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> HnswStats {
        let mut layer_counts = vec![0usize; self.max_layer + 1];
        let mut total_edges = 0;
        for node in &self.nodes {
            for (layer, neighbors) in node.layers.iter().enumerate() {
                if let Some(count) = layer_counts.get_mut(layer) {
                    *count += 1;
                }
                total_edges += neighbors.len();
            }
        }
        HnswStats {
            num_nodes: self.nodes.len(),
            max_layer: self.max_layer,
            layer_counts,
            total_edges,
            m: self.m,
            ef_construction: self.ef_construction,
        }
    }
}

/// Diversity heuristic: keep a candidate only if it is closer to the base than
/// to every neighbor already kept, then top up with the closest leftovers.
fn select_neighbors(candidates: &[Scored], m: usize, vectors: &VectorStore) -> Vec<Scored> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| a.rank(b));

    let mut kept: Vec<Scored> = Vec::with_capacity(m);
    for candidate in &sorted {
        if kept.len() >= m {
            break;
        }
        let v = vectors.vector_unchecked(candidate.id);
        let diverse = kept.iter().all(|existing| {
            l2_distance_squared(v, vectors.vector_unchecked(existing.id)) >= candidate.distance
        });
        if diverse {
            kept.push(*candidate);
        }
    }

    if kept.len() < m {
        for candidate in &sorted {
            if kept.len() >= m {
                break;
            }
            if !kept.iter().any(|s| s.id == candidate.id) {
                kept.push(*candidate);
            }
        }
    }
    kept
}

/// Graph shape summary
#[derive(Debug, Clone)]
pub struct HnswStats {
    pub num_nodes: usize,
    pub max_layer: usize,
    /// Nodes present on each layer
    pub layer_counts: Vec<usize>,
    pub total_edges: usize,
    pub m: usize,
    pub ef_construction: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn random_store(count: usize, dim: usize, seed: u64) -> VectorStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = VectorStore::new(dim);
        for i in 0..count {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
            store.append(&v, &format!("v{}", i)).unwrap();
        }
        store
    }

    fn build(store: &VectorStore, m: usize, ef: usize) -> Hnsw {
        let mut hnsw = Hnsw::new(m, ef, 7);
        for i in 0..store.size() {
            hnsw.insert(i, store);
        }
        hnsw
    }

    #[test]
    fn test_insert_single() {
        let store = random_store(1, 32, 1);
        let hnsw = build(&store, 16, 100);
        assert_eq!(hnsw.len(), 1);
        assert_eq!(hnsw.entry_point(), Some(0));
    }

    #[test]
    fn test_search_empty_graph() {
        let store = VectorStore::new(8);
        let hnsw = Hnsw::new(16, 100, 0);
        assert!(hnsw.search(&[0.0; 8], 5, 50, &store).is_empty());
    }

    #[test]
    fn test_self_retrieval() {
        let store = random_store(200, 64, 2);
        let hnsw = build(&store, 16, 100);
        for i in 0..store.size() {
            let results = hnsw.search(store.vector_unchecked(i), 1, 64, &store);
            assert_eq!(results[0].0, i, "vector {} should find itself", i);
            assert_eq!(results[0].1, 0.0);
        }
    }

    #[test]
    fn test_recall_against_brute_force() {
        let store = random_store(1000, 32, 3);
        let hnsw = build(&store, 16, 100);
        let queries = random_store(20, 32, 99);
        let k = 10;

        let mut total = 0.0;
        for (_, q) in queries.iter() {
            let mut truth: Vec<(usize, f32)> = (0..store.size())
                .map(|i| (i, l2_distance_squared(q, store.vector_unchecked(i))))
                .collect();
            truth.sort_by(|a, b| a.1.total_cmp(&b.1));
            let truth: HashSet<usize> = truth.iter().take(k).map(|(i, _)| *i).collect();
            let got: HashSet<usize> = hnsw.search(q, k, 64, &store).iter().map(|(i, _)| *i).collect();
            total += truth.intersection(&got).count() as f64 / k as f64;
        }
        let recall = total / queries.size() as f64;
        assert!(recall > 0.8, "recall@10 should exceed 80%, got {:.2}", recall);
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let store = random_store(50, 16, 4);
        let hnsw = build(&store, 8, 50);
        let results = hnsw.search(store.vector_unchecked(3), 100, 10, &store);
        assert_eq!(results.len(), 50);
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        assert!(hnsw.search(store.vector_unchecked(3), 0, 10, &store).is_empty());
    }

    #[test]
    fn test_same_seed_same_graph() {
        let store = random_store(100, 16, 5);
        let a = build(&store, 8, 40);
        let b = build(&store, 8, 40);
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.entry_point, b.entry_point);
    }

    #[test]
    fn test_degree_caps_hold() {
        let store = random_store(300, 16, 6);
        let hnsw = build(&store, 6, 40);
        for node in hnsw.nodes() {
            assert!(node.neighbors(0).len() <= hnsw.m0);
            for layer in 1..node.layers.len() {
                assert!(node.neighbors(layer).len() <= hnsw.m);
            }
        }
        assert!(hnsw.validate(store.size()).is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let store = random_store(10, 4, 8);
        let mut hnsw = build(&store, 4, 20);
        assert!(hnsw.validate(11).is_err());
        hnsw.nodes[0].layers[0].push(999);
        assert!(hnsw.validate(10).is_err());
    }

    #[test]
    fn test_duplicate_vectors_tie_break_on_position() {
        let mut store = VectorStore::new(2);
        for i in 0..20 {
            store.append(&[1.0, 1.0], &format!("dup{}", i)).unwrap();
        }
        let hnsw = build(&store, 4, 50);
        let results = hnsw.search(&[1.0, 1.0], 5, 50, &store);
        let ids: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stats() {
        let store = random_store(100, 8, 9);
        let stats = build(&store, 16, 50).stats();
        assert_eq!(stats.num_nodes, 100);
        assert_eq!(stats.m, 16);
        assert_eq!(stats.layer_counts[0], 100);
        assert!(stats.total_edges > 0);
    }
}
