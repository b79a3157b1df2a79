//! HNSW (Hierarchical Navigable Small World) graph
//!
//! The approximate search structure behind [`SearchStrategy::Hnsw`]. Node `n`
//! is the vector at store position `n`; the graph never owns vector data and
//! borrows the [`VectorStore`] for every distance it computes.
//!
//! ```text
//! Layer 2: ●───────────────────●            (few nodes, long-range links)
//!          │                   │
//! Layer 1: ●──────●──────●─────●
//!          │      │      │     │
//! Layer 0: ●──●──●──●──●──●──●──●──●        (every node)
//! ```
//!
//! [`SearchStrategy::Hnsw`]: crate::index::SearchStrategy::Hnsw
//! [`VectorStore`]: crate::store::VectorStore

mod codec;
mod graph;
mod visited;

pub use graph::{Hnsw, HnswStats, Node};
