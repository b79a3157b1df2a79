//! .lkx index blob format
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "LKXIDX01"
//! 0x08     4       u32 LE      N: Number of vectors
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     1       u8          Strategy: 0 = flat, 1 = hnsw
//! 0x11     3       [u8; 3]     Reserved (zero)
//! 0x14     N*D*4   [f32]       Vector data (Little Endian)
//! ...              graph       HNSW section (hnsw strategy only)
//! ```
//!
//! Identifiers are not stored here; they live in the manifest next to the blob.

use std::io;

use thiserror::Error;

use crate::hnsw::Hnsw;
use crate::index::{SearchStrategy, SimilarityIndex};

/// Magic bytes identifying a .lkx file: "LKXIDX01"
pub const MAGIC: [u8; 8] = *b"LKXIDX01";

/// Header size in bytes: 8 (magic) + 4 (count) + 4 (dims) + 1 (strategy) + 3 (reserved)
pub const HEADER_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected LKXIDX01")]
    InvalidMagic,

    #[error("Unknown strategy tag {0}")]
    UnknownStrategy(u8),

    #[error("Blob truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("Index too large for the blob format: {0}")]
    TooLarge(String),

    #[error("Graph section: {0}")]
    Graph(io::Error),
}

/// Parsed .lkx header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LkxHeader {
    pub count: u32,
    pub dimensions: u32,
    pub strategy: SearchStrategy,
}

fn strategy_tag(strategy: SearchStrategy) -> u8 {
    match strategy {
        SearchStrategy::Flat => 0,
        SearchStrategy::Hnsw => 1,
    }
}

impl LkxHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[8..12]);
        let count = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[12..16]);
        let dimensions = u32::from_le_bytes(word);
        let strategy = match bytes[16] {
            0 => SearchStrategy::Flat,
            1 => SearchStrategy::Hnsw,
            other => return Err(FormatError::UnknownStrategy(other)),
        };

        Ok(Self {
            count,
            dimensions,
            strategy,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[16] = strategy_tag(self.strategy);
        buf
    }

    /// Byte length of the vector section
    pub fn vectors_len(&self) -> Result<usize, FormatError> {
        (self.count as usize)
            .checked_mul(self.dimensions as usize)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| {
                FormatError::TooLarge(format!(
                    "{} vectors of {} dimensions",
                    self.count, self.dimensions
                ))
            })
    }
}

/// Contents of a decoded blob
#[derive(Debug)]
pub struct DecodedBlob {
    pub header: LkxHeader,
    /// `count * dimensions` floats in position order
    pub vectors: Vec<f32>,
    pub graph: Option<Hnsw>,
}

/// Serialize an index's vectors (and graph, for HNSW) into a blob
pub fn encode_index(index: &SimilarityIndex) -> Result<Vec<u8>, FormatError> {
    let count = u32::try_from(index.size())
        .map_err(|_| FormatError::TooLarge(format!("{} vectors", index.size())))?;
    let dimensions = u32::try_from(index.dim())
        .map_err(|_| FormatError::TooLarge(format!("{} dimensions", index.dim())))?;
    let header = LkxHeader {
        count,
        dimensions,
        strategy: index.strategy(),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + header.vectors_len()?);
    buf.extend_from_slice(&header.to_bytes());
    for &val in index.store().raw_vectors() {
        buf.extend_from_slice(&val.to_le_bytes());
    }
    if let Some(graph) = index.graph() {
        graph.write_to(&mut buf).map_err(FormatError::Graph)?;
    }
    Ok(buf)
}

/// Parse a blob written by [`encode_index`]
pub fn decode_index(bytes: &[u8]) -> Result<DecodedBlob, FormatError> {
    let header = LkxHeader::from_bytes(bytes)?;
    let vectors_end = HEADER_SIZE
        .checked_add(header.vectors_len()?)
        .ok_or_else(|| FormatError::TooLarge("vector section".to_string()))?;
    if bytes.len() < vectors_end {
        return Err(FormatError::Truncated {
            expected: vectors_end,
            actual: bytes.len(),
        });
    }

    let vectors: Vec<f32> = bytes[HEADER_SIZE..vectors_end]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut rest = &bytes[vectors_end..];
    let graph = match header.strategy {
        SearchStrategy::Flat => None,
        SearchStrategy::Hnsw => {
            Some(Hnsw::read_from(&mut rest, header.count as usize).map_err(FormatError::Graph)?)
        }
    };
    if !rest.is_empty() {
        return Err(FormatError::TrailingBytes(rest.len()));
    }

    Ok(DecodedBlob {
        header,
        vectors,
        graph,
    })
}
