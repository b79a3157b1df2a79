//! In-memory vector store
//!
//! Vectors live back to back in a single `Vec<f32>` (`count * dim` floats) with
//! a parallel identifier list. Position `n` addresses the `n`th appended record
//! in both, which is how search results are resolved back to identifiers.
//!
//! The store is append-only: there is no removal or in-place mutation.

use crate::index::IndexError;

/// Append-only store of fixed-dimension vectors and their identifiers
#[derive(Debug, Clone)]
pub struct VectorStore {
    dim: usize,
    data: Vec<f32>,
    identifiers: Vec<String>,
}

impl VectorStore {
    /// Create an empty store for `dim`-dimensional vectors
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
            identifiers: Vec::new(),
        }
    }

    /// Create an empty store with room for `capacity` records
    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            data: Vec::with_capacity(dim * capacity),
            identifiers: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of records
    #[inline]
    pub fn size(&self) -> usize {
        self.identifiers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Check a record without storing it.
    ///
    /// `append` runs the same checks; callers that must validate before touching
    /// other state (the search structure, the append log) use this directly.
    pub fn validate(&self, vector: &[f32], identifier: &str) -> Result<(), IndexError> {
        self.validate_vector(vector)?;
        if identifier.trim().is_empty() {
            return Err(IndexError::EmptyIdentifier);
        }
        Ok(())
    }

    /// Check a vector's length and components
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if let Some(component) = vector.iter().position(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteComponent { component });
        }
        Ok(())
    }

    /// Append a record, returning its position
    pub fn append(&mut self, vector: &[f32], identifier: &str) -> Result<usize, IndexError> {
        self.validate(vector, identifier)?;
        let position = self.identifiers.len();
        self.data.extend_from_slice(vector);
        self.identifiers.push(identifier.to_string());
        Ok(position)
    }

    /// Identifier stored at `position`
    pub fn get_identifier(&self, position: usize) -> Result<&str, IndexError> {
        self.identifiers
            .get(position)
            .map(String::as_str)
            .ok_or(IndexError::OutOfRange {
                position,
                size: self.size(),
            })
    }

    /// Vector stored at `position`
    pub fn get_vector(&self, position: usize) -> Result<&[f32], IndexError> {
        if position >= self.size() {
            return Err(IndexError::OutOfRange {
                position,
                size: self.size(),
            });
        }
        Ok(self.vector_unchecked(position))
    }

    /// Vector slice for a position known to be in range.
    ///
    /// # Panics
    ///
    /// Panics if `position >= size()`.
    #[inline(always)]
    pub(crate) fn vector_unchecked(&self, position: usize) -> &[f32] {
        let start = position * self.dim;
        &self.data[start..start + self.dim]
    }

    /// Raw contiguous vector data (`size() * dim()` floats)
    pub fn raw_vectors(&self) -> &[f32] {
        &self.data
    }

    /// All identifiers in insertion order
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Iterate `(identifier, vector)` pairs in insertion order
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &[f32])> + '_ {
        self.identifiers
            .iter()
            .enumerate()
            .map(move |(pos, id)| (id.as_str(), self.vector_unchecked(pos)))
    }

    /// Approximate heap footprint in bytes
    pub fn memory_bytes(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<f32>()
            + self
                .identifiers
                .iter()
                .map(|s| s.capacity() + std::mem::size_of::<String>())
                .sum::<usize>()
    }
}
