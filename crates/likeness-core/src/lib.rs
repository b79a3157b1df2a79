//! likeness-core – vector store, similarity index and snapshot persistence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                SimilarityIndex (flat | HNSW)                │
//! │        exact L2² re-rank · insertion-order tie-break        │
//! ├─────────────────────────────────────────────────────────────┤
//! │        VectorStore (contiguous f32 + identifiers)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │   SnapshotStore: index.lkx + identifiers.json + records.wal │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod embed;
pub mod format;
pub mod hnsw;
pub mod index;
pub mod simd;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use embed::{ByteHistogramEmbedder, EmbedError, Embedder};
pub use index::{IndexError, IndexParams, IndexStats, Neighbor, SearchStrategy, SimilarityIndex};
pub use simd::{l2_distance, l2_distance_squared};
pub use snapshot::{RebuildReport, Restored, SnapshotError, SnapshotStore};
pub use store::VectorStore;
