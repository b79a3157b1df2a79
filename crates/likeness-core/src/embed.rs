//! Image embedding boundary
//!
//! The index never decodes images itself; it asks an [`Embedder`] for a
//! fixed-length feature vector. [`ByteHistogramEmbedder`] is a deterministic,
//! model-free implementation used by the service and the tests.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbedError {
    #[error("Unsupported image format (expected PNG or JPEG)")]
    UnsupportedFormat,

    #[error("Empty image payload")]
    EmptyInput,
}

/// Turns image bytes into a feature vector of `dim()` components.
///
/// Implementations must be deterministic: identical bytes give identical
/// vectors.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const JPEG_SIGNATURE: [u8; 3] = [0xff, 0xd8, 0xff];

/// Identify an image by its leading signature bytes
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&PNG_SIGNATURE) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&JPEG_SIGNATURE) {
        Some(ImageFormat::Jpeg)
    } else {
        None
    }
}

/// File extensions accepted when scanning an image directory
pub fn is_image_extension(ext: &str) -> bool {
    matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg")
}

const BIGRAMS: usize = 1 << 16;

/// Largest output size [`ByteHistogramEmbedder`] supports
pub const MAX_HISTOGRAM_DIM: usize = BIGRAMS;

/// Byte-bigram histogram folded into `dim` bins, L1-normalised.
///
/// Bytes that are similar in content land in similar bins, which is enough for
/// exact duplicates to sit at distance 0 and near-duplicates close by.
#[derive(Debug, Clone)]
pub struct ByteHistogramEmbedder {
    dim: usize,
}

impl ByteHistogramEmbedder {
    /// `dim` is clamped to `1..=65536`
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.clamp(1, BIGRAMS),
        }
    }
}

impl Embedder for ByteHistogramEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbedError> {
        if bytes.is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        if sniff_format(bytes).is_none() {
            return Err(EmbedError::UnsupportedFormat);
        }

        let mut counts = vec![0u32; self.dim];
        let mut prev = 0u8;
        for &b in bytes {
            let bigram = ((prev as usize) << 8) | b as usize;
            counts[bigram * self.dim / BIGRAMS] += 1;
            prev = b;
        }

        let total = bytes.len() as f32;
        Ok(counts.into_iter().map(|c| c as f32 / total).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(payload: &[u8]) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&png(b"IHDR")), Some(ImageFormat::Png));
        assert_eq!(sniff_format(&[0xff, 0xd8, 0xff, 0xe0]), Some(ImageFormat::Jpeg));
        assert_eq!(sniff_format(b"GIF89a"), None);
        assert_eq!(sniff_format(&[]), None);
    }

    #[test]
    fn test_extensions() {
        assert!(is_image_extension("png"));
        assert!(is_image_extension("JPG"));
        assert!(is_image_extension("Jpeg"));
        assert!(!is_image_extension("gif"));
    }

    #[test]
    fn test_embedding_is_deterministic_and_normalised() {
        let embedder = ByteHistogramEmbedder::new(64);
        let bytes = png(b"some pixels go here");
        let a = embedder.embed(&bytes).unwrap();
        let b = embedder.embed(&bytes).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let sum: f32 = a.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_different_content_embeds_differently() {
        let embedder = ByteHistogramEmbedder::new(128);
        let a = embedder.embed(&png(&[0u8; 200])).unwrap();
        let b = embedder.embed(&png(&[0xee; 200])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_non_images() {
        let embedder = ByteHistogramEmbedder::new(8);
        assert_eq!(embedder.embed(&[]), Err(EmbedError::EmptyInput));
        assert_eq!(embedder.embed(b"plain text"), Err(EmbedError::UnsupportedFormat));
    }

    #[test]
    fn test_dim_clamped() {
        assert_eq!(ByteHistogramEmbedder::new(0).dim(), 1);
        assert_eq!(ByteHistogramEmbedder::new(1 << 20).dim(), 1 << 16);
    }
}
