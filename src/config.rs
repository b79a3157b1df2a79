use std::path::PathBuf;

use likeness_core::{IndexParams, SearchStrategy};

pub const DEFAULT_DIM: usize = 512;
pub const DEFAULT_IDENTIFIER_PREFIX: &str = "static/images";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Service layout and tuning.
///
/// ```text
/// <data_dir>/
///   images/   uploaded reference images (rebuild source)
///   index/    index.lkx, identifiers.json, records.wal
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    pub index_dir: PathBuf,
    pub dim: usize,
    pub strategy: SearchStrategy,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    pub seed: u64,
    /// Write a full snapshot every N inserts; records in between go to the append log
    pub snapshot_every: usize,
    /// Prepended (with `/`) to stored image file names to form identifiers
    pub identifier_prefix: String,
    pub max_upload_bytes: usize,
}

impl ServiceConfig {
    pub fn from_data_dir(data_dir: PathBuf, dim: usize) -> Self {
        let images_dir = data_dir.join("images");
        let index_dir = data_dir.join("index");
        let defaults = IndexParams::flat(dim);

        Self {
            data_dir,
            images_dir,
            index_dir,
            dim,
            strategy: defaults.strategy,
            hnsw_m: defaults.hnsw_m,
            hnsw_ef_construction: defaults.hnsw_ef_construction,
            hnsw_ef_search: defaults.hnsw_ef_search,
            seed: defaults.seed,
            snapshot_every: 1,
            identifier_prefix: DEFAULT_IDENTIFIER_PREFIX.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            dim: self.dim,
            strategy: self.strategy,
            hnsw_m: self.hnsw_m,
            hnsw_ef_construction: self.hnsw_ef_construction,
            hnsw_ef_search: self.hnsw_ef_search,
            seed: self.seed,
        }
    }

    /// Identifier for an image stored as `file_name` in the images dir
    pub fn identifier_for(&self, file_name: &str) -> String {
        let prefix = self.identifier_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", prefix, file_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_defaults() {
        let config = ServiceConfig::from_data_dir(PathBuf::from("/srv/likeness"), 64);
        assert_eq!(config.images_dir, PathBuf::from("/srv/likeness/images"));
        assert_eq!(config.index_dir, PathBuf::from("/srv/likeness/index"));
        assert_eq!(config.snapshot_every, 1);
        assert_eq!(config.strategy, SearchStrategy::Flat);

        let params = config.index_params();
        assert_eq!(params.dim, 64);
        assert_eq!(params.hnsw_m, 16);
        assert_eq!(params.hnsw_ef_construction, 100);
    }

    #[test]
    fn test_identifier_for() {
        let mut config = ServiceConfig::from_data_dir(PathBuf::from("data"), 8);
        assert_eq!(config.identifier_for("ab12_cat.png"), "static/images/ab12_cat.png");
        config.identifier_prefix = String::new();
        assert_eq!(config.identifier_for("cat.png"), "cat.png");
    }
}
