//! Query coordinator
//!
//! Owns the live [`SimilarityIndex`] and its [`SnapshotStore`], and is the only
//! way the HTTP layer or the CLI touches either.
//!
//! # Concurrency Model
//!
//! - **Search**: read lock on the index. Searches run concurrently with each
//!   other and with snapshot serialization.
//! - **Insert**: the writer mutex serialises validate + append + log + snapshot
//!   across writers; the index write lock is held only for the in-memory append,
//!   so the store and the search structure change together.
//!
//! Lock order is always writer mutex, then index lock.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use likeness_core::embed::{is_image_extension, sniff_format, ImageFormat};
use likeness_core::snapshot::SkippedFile;
use likeness_core::{
    EmbedError, Embedder, IndexError, SearchStrategy, SimilarityIndex, SnapshotError,
    SnapshotStore,
};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

use crate::config::ServiceConfig;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Index is not ready yet")]
    NotReady,

    #[error("Coordinator already started")]
    AlreadyStarted,

    #[error("No images are indexed yet")]
    EmptyIndex,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A persistence step failed after the insert was applied in memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceWarning {
    pub message: String,
}

impl PersistenceWarning {
    fn new(stage: &str, err: impl std::fmt::Display) -> Self {
        Self {
            message: format!("{}: {}", stage, err),
        }
    }
}

impl std::fmt::Display for PersistenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Uninitialized,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupSource {
    /// Restored from the snapshot in the index directory
    Snapshot,
    /// Rebuilt from the images directory
    Rebuilt,
    /// Nothing to restore or rebuild
    Empty,
}

#[derive(Debug, Clone)]
pub struct StartupReport {
    pub source: StartupSource,
    pub vectors: usize,
    /// Log records re-applied on top of the snapshot
    pub replayed: usize,
    /// Log records or image files that could not be used
    pub discarded: usize,
    pub skipped: Vec<SkippedFile>,
    pub warning: Option<PersistenceWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsertOutcome {
    pub position: usize,
    pub identifier: String,
    pub warning: Option<PersistenceWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub identifier: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub state: CoordinatorState,
    pub vectors: usize,
    pub dim: usize,
    pub strategy: SearchStrategy,
    pub memory_bytes: usize,
    pub graph_layers: usize,
    pub graph_edges: usize,
    /// Inserts applied since the last successful snapshot
    pub unsnapshotted: usize,
}

struct WriterState {
    snapshots: Option<SnapshotStore>,
}

pub struct Coordinator {
    config: ServiceConfig,
    embedder: Arc<dyn Embedder>,
    index: RwLock<SimilarityIndex>,
    writer: Mutex<WriterState>,
    /// Inserts not yet covered by a snapshot; only changed under `writer`
    unsnapshotted: AtomicUsize,
    ready: AtomicBool,
}

impl Coordinator {
    pub fn new(config: ServiceConfig, embedder: Arc<dyn Embedder>) -> Self {
        if embedder.dim() != config.dim {
            tracing::warn!(
                embedder_dim = embedder.dim(),
                index_dim = config.dim,
                "embedder and index dimensions differ; image inserts will be rejected"
            );
        }
        let index = SimilarityIndex::new(config.index_params());
        Self {
            config,
            embedder,
            index: RwLock::new(index),
            writer: Mutex::new(WriterState { snapshots: None }),
            unsnapshotted: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        if self.ready.load(AtomicOrdering::SeqCst) {
            CoordinatorState::Ready
        } else {
            CoordinatorState::Uninitialized
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CoordinatorState::Ready
    }

    fn ensure_ready(&self) -> Result<(), CoordinatorError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CoordinatorError::NotReady)
        }
    }

    /// Restore or rebuild the index and move to `Ready`.
    ///
    /// Never fails for lack of data: a missing or corrupt snapshot falls back
    /// to a rebuild from the images directory, and that falls back to an empty
    /// index.
    pub fn start(&self) -> Result<StartupReport, CoordinatorError> {
        let mut writer = self.writer.lock();
        if self.is_ready() {
            return Err(CoordinatorError::AlreadyStarted);
        }
        let params = self.config.index_params();

        writer.snapshots = match SnapshotStore::open(&self.config.index_dir) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::error!(
                    dir = %self.config.index_dir.display(),
                    error = %e,
                    "index directory unavailable; running without persistence"
                );
                None
            }
        };

        let loaded = match writer.snapshots.as_mut() {
            Some(store) => match store.load(&params) {
                Ok(restored) if restored.index.is_empty() => {
                    tracing::info!("snapshot holds no records, rebuilding from images");
                    None
                }
                Ok(restored) => Some(restored),
                Err(SnapshotError::NotFound(reason)) => {
                    tracing::info!(%reason, "no snapshot, rebuilding from images");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot unusable, rebuilding from images");
                    None
                }
            },
            None => None,
        };

        let mut report = match loaded {
            Some(restored) => {
                let report = StartupReport {
                    source: StartupSource::Snapshot,
                    vectors: restored.index.size(),
                    replayed: restored.replayed,
                    discarded: restored.discarded,
                    skipped: Vec::new(),
                    warning: None,
                };
                *self.index.write() = restored.index;
                report
            }
            None => {
                let (index, skipped) = match SnapshotStore::rebuild_from_directory(
                    &self.config.images_dir,
                    self.embedder.as_ref(),
                    &params,
                    &self.config.identifier_prefix,
                ) {
                    Ok((index, rebuild)) => (index, rebuild.skipped),
                    Err(e) => {
                        tracing::error!(error = %e, "rebuild failed, starting empty");
                        (SimilarityIndex::new(params.clone()), Vec::new())
                    }
                };
                let report = StartupReport {
                    source: if index.is_empty() {
                        StartupSource::Empty
                    } else {
                        StartupSource::Rebuilt
                    },
                    vectors: index.size(),
                    replayed: 0,
                    discarded: skipped.len(),
                    skipped,
                    warning: None,
                };
                *self.index.write() = index;
                report
            }
        };

        let needs_snapshot = report.source != StartupSource::Snapshot
            || writer.snapshots.as_ref().is_some_and(|s| !s.log_in_sync());
        report.warning = match writer.snapshots.as_mut() {
            None => Some(PersistenceWarning::new("startup", "index directory unavailable")),
            Some(store) if needs_snapshot => self
                .write_snapshot(store)
                .err()
                .map(|e| PersistenceWarning::new("startup snapshot", e)),
            Some(_) => None,
        };
        let pending = writer
            .snapshots
            .as_ref()
            .map_or(0, |s| s.pending_records());
        self.unsnapshotted.store(pending, AtomicOrdering::SeqCst);

        if let Some(warning) = &report.warning {
            tracing::warn!(%warning, "startup persistence incomplete");
        }
        self.ready.store(true, AtomicOrdering::SeqCst);
        tracing::info!(
            source = ?report.source,
            vectors = report.vectors,
            replayed = report.replayed,
            discarded = report.discarded,
            dim = self.config.dim,
            strategy = %self.config.strategy,
            "coordinator ready"
        );
        Ok(report)
    }

    /// Register `vector` under `identifier`.
    ///
    /// Validation failures leave the index untouched. Once the record is in
    /// memory the call succeeds; a failed snapshot or log write is reported in
    /// [`InsertOutcome::warning`].
    pub fn handle_insert(
        &self,
        identifier: &str,
        vector: &[f32],
    ) -> Result<InsertOutcome, CoordinatorError> {
        self.ensure_ready()?;
        let mut writer = self.writer.lock();

        let position = self.index.write().insert(vector, identifier)?;
        let warning = self.persist_insert(&mut writer, identifier, vector);
        if let Some(warning) = &warning {
            tracing::warn!(%identifier, position, %warning, "insert not fully persisted");
        } else {
            tracing::debug!(%identifier, position, "inserted");
        }

        Ok(InsertOutcome {
            position,
            identifier: identifier.to_string(),
            warning,
        })
    }

    fn persist_insert(
        &self,
        writer: &mut WriterState,
        identifier: &str,
        vector: &[f32],
    ) -> Option<PersistenceWarning> {
        let Some(snapshots) = writer.snapshots.as_mut() else {
            return Some(PersistenceWarning::new("persist", "index directory unavailable"));
        };

        let pending = self.unsnapshotted.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if pending < self.config.snapshot_every.max(1) {
            return snapshots
                .append_log(identifier, vector)
                .err()
                .map(|e| PersistenceWarning::new("append log", e));
        }

        match self.write_snapshot(snapshots) {
            Ok(()) => {
                self.unsnapshotted.store(0, AtomicOrdering::SeqCst);
                None
            }
            Err(e) => {
                // the record stays recoverable from the log until the next good snapshot
                if let Err(log_err) = snapshots.append_log(identifier, vector) {
                    tracing::warn!(error = %log_err, "append log fallback failed");
                }
                Some(PersistenceWarning::new("snapshot", e))
            }
        }
    }

    fn write_snapshot(&self, snapshots: &mut SnapshotStore) -> Result<(), SnapshotError> {
        let encoded = {
            let index = self.index.read();
            SnapshotStore::encode(&index)?
        };
        snapshots.write(&encoded)
    }

    /// Up to `k` nearest identifiers to `vector`, nearest first
    pub fn handle_search(&self, vector: &[f32], k: usize) -> Result<Vec<Match>, CoordinatorError> {
        self.ensure_ready()?;
        let index = self.index.read();
        if index.is_empty() {
            return Err(CoordinatorError::EmptyIndex);
        }

        let hits = index.search(vector, k)?;
        let matches = hits
            .into_iter()
            .filter_map(|hit| match index.identifier(hit.position) {
                Ok(identifier) => Some(Match {
                    identifier: identifier.to_string(),
                    distance: hit.distance,
                }),
                Err(e) => {
                    tracing::warn!(position = hit.position, error = %e, "dropping unresolvable hit");
                    None
                }
            })
            .collect();
        Ok(matches)
    }

    /// Store an uploaded image, embed it and index it.
    ///
    /// The file lands in the images directory as `<random hex>_<name>`; it is
    /// removed again if the insert is rejected.
    pub fn register_image(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<InsertOutcome, CoordinatorError> {
        self.ensure_ready()?;
        let vector = self.embedder.embed(bytes)?;
        let stored_name = stored_file_name(file_name, sniff_format(bytes));

        fs::create_dir_all(&self.config.images_dir)?;
        let path = self.config.images_dir.join(&stored_name);
        fs::write(&path, bytes)?;

        let identifier = self.config.identifier_for(&stored_name);
        match self.handle_insert(&identifier, &vector) {
            Ok(outcome) => {
                tracing::info!(file = %stored_name, position = outcome.position, "image registered");
                Ok(outcome)
            }
            Err(e) => {
                remove_quietly(&path);
                Err(e)
            }
        }
    }

    /// Nearest registered images to an uploaded query image
    pub fn find_similar(&self, bytes: &[u8], k: usize) -> Result<Vec<Match>, CoordinatorError> {
        self.ensure_ready()?;
        let vector = self.embedder.embed(bytes)?;
        self.handle_search(&vector, k)
    }

    /// Write a snapshot now, covering any batched inserts
    pub fn flush(&self) -> Result<(), CoordinatorError> {
        self.ensure_ready()?;
        let mut writer = self.writer.lock();
        let snapshots = writer.snapshots.as_mut().ok_or_else(|| {
            CoordinatorError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "index directory unavailable",
            ))
        })?;
        self.write_snapshot(snapshots)?;
        self.unsnapshotted.store(0, AtomicOrdering::SeqCst);
        tracing::info!(vectors = self.index.read().size(), "snapshot flushed");
        Ok(())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let unsnapshotted = self.unsnapshotted.load(AtomicOrdering::SeqCst);
        let index_stats = self.index.read().stats();
        CoordinatorStats {
            state: self.state(),
            vectors: index_stats.vectors,
            dim: index_stats.dim,
            strategy: index_stats.strategy,
            memory_bytes: index_stats.memory_bytes,
            graph_layers: index_stats.graph_layers,
            graph_edges: index_stats.graph_edges,
            unsnapshotted,
        }
    }
}

/// `<16 hex>_<sanitized name>`, with an image extension the rebuild scan accepts
fn stored_file_name(original: &str, format: Option<ImageFormat>) -> String {
    let base = original
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let mut name: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = name.trim_start_matches('.');
    name = if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    };

    let has_image_ext = Path::new(&name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(is_image_extension);
    if !has_image_ext {
        name.push_str(match format {
            Some(ImageFormat::Jpeg) => ".jpg",
            _ => ".png",
        });
    }

    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(17 + name.len());
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.push('_');
    out.push_str(&name);
    out
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not remove rejected upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use likeness_core::ByteHistogramEmbedder;
    use tempfile::tempdir;

    fn coordinator(dir: &Path, dim: usize) -> Coordinator {
        let config = ServiceConfig::from_data_dir(dir.to_path_buf(), dim);
        Coordinator::new(config, Arc::new(ByteHistogramEmbedder::new(dim)))
    }

    fn png(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_not_ready_before_start() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 3);
        assert_eq!(coord.state(), CoordinatorState::Uninitialized);
        assert!(matches!(
            coord.handle_insert("a", &[1.0, 0.0, 0.0]),
            Err(CoordinatorError::NotReady)
        ));
        assert!(matches!(
            coord.handle_search(&[1.0, 0.0, 0.0], 1),
            Err(CoordinatorError::NotReady)
        ));
        assert!(matches!(coord.flush(), Err(CoordinatorError::NotReady)));
    }

    #[test]
    fn test_start_empty_then_search_is_empty_index() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 3);
        let report = coord.start().unwrap();
        assert_eq!(report.source, StartupSource::Empty);
        assert!(report.warning.is_none());
        assert!(coord.is_ready());
        assert!(matches!(
            coord.handle_search(&[0.0, 0.0, 1.0], 3),
            Err(CoordinatorError::EmptyIndex)
        ));
        assert!(matches!(coord.start(), Err(CoordinatorError::AlreadyStarted)));
    }

    #[test]
    fn test_stats_do_not_wait_for_the_writer() {
        let dir = tempdir().unwrap();
        let mut config = ServiceConfig::from_data_dir(dir.path().to_path_buf(), 3);
        config.snapshot_every = 10;
        let coord = Coordinator::new(config, Arc::new(ByteHistogramEmbedder::new(3)));
        coord.start().unwrap();
        coord.handle_insert("a", &[1.0, 0.0, 0.0]).unwrap();
        coord.handle_insert("b", &[0.0, 1.0, 0.0]).unwrap();

        // a writer mid-snapshot holds this for the whole encode and fsync
        let _writer = coord.writer.lock();
        let stats = coord.stats();
        assert_eq!(stats.vectors, 2);
        assert_eq!(stats.unsnapshotted, 2);
    }

    #[test]
    fn test_axis_scenario() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 3);
        coord.start().unwrap();

        assert_eq!(coord.handle_insert("a", &[1.0, 0.0, 0.0]).unwrap().position, 0);
        assert_eq!(coord.handle_insert("b", &[0.0, 1.0, 0.0]).unwrap().position, 1);
        let c = coord.handle_insert("c", &[0.0, 0.0, 1.0]).unwrap();
        assert_eq!(c.position, 2);
        assert!(c.warning.is_none());

        let matches = coord.handle_search(&[1.0, 0.0, 0.1], 2).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].identifier, "a");
        assert!((matches[0].distance - 0.01).abs() < 1e-5);
        assert_eq!(matches[1].identifier, "c");
    }

    #[test]
    fn test_invalid_insert_surfaces_error() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 3);
        coord.start().unwrap();
        assert!(matches!(
            coord.handle_insert("short", &[1.0]),
            Err(CoordinatorError::Index(IndexError::DimensionMismatch { .. }))
        ));
        assert!(matches!(
            coord.handle_insert("", &[1.0, 0.0, 0.0]),
            Err(CoordinatorError::Index(IndexError::EmptyIdentifier))
        ));
        assert_eq!(coord.stats().vectors, 0);
    }

    #[test]
    fn test_unwritable_index_dir_warns_but_inserts() {
        let dir = tempdir().unwrap();
        let mut config = ServiceConfig::from_data_dir(dir.path().to_path_buf(), 3);
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        config.index_dir = blocker.join("index");
        let coord = Coordinator::new(config, Arc::new(ByteHistogramEmbedder::new(3)));

        let report = coord.start().unwrap();
        assert!(report.warning.is_some());

        let outcome = coord.handle_insert("a", &[1.0, 0.0, 0.0]).unwrap();
        assert!(outcome.warning.is_some());
        assert_eq!(coord.handle_search(&[1.0, 0.0, 0.0], 1).unwrap()[0].identifier, "a");
    }

    #[test]
    fn test_register_and_find_image() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 32);
        coord.start().unwrap();

        let cat = png(b"whiskers whiskers whiskers");
        let outcome = coord.register_image("../../cat photo.png", &cat).unwrap();
        assert!(outcome.identifier.starts_with("static/images/"));
        assert!(outcome.identifier.ends_with("_cat_photo.png"));

        let stored = outcome.identifier.trim_start_matches("static/images/");
        assert!(dir.path().join("images").join(stored).is_file());

        let matches = coord.find_similar(&cat, 1).unwrap();
        assert_eq!(matches[0].identifier, outcome.identifier);
        assert_eq!(matches[0].distance, 0.0);
    }

    #[test]
    fn test_register_rejects_non_image() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), 8);
        coord.start().unwrap();
        assert!(matches!(
            coord.register_image("notes.txt", b"hello"),
            Err(CoordinatorError::Embed(EmbedError::UnsupportedFormat))
        ));
        let images = dir.path().join("images");
        let leftover = fs::read_dir(&images).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_register_removes_file_on_rejected_insert() {
        let dir = tempdir().unwrap();
        let config = ServiceConfig::from_data_dir(dir.path().to_path_buf(), 8);
        // embedder produces 4 components for an 8-dimensional index
        let coord = Coordinator::new(config, Arc::new(ByteHistogramEmbedder::new(4)));
        coord.start().unwrap();

        assert!(matches!(
            coord.register_image("x.png", &png(b"abc")),
            Err(CoordinatorError::Index(IndexError::DimensionMismatch { .. }))
        ));
        assert_eq!(fs::read_dir(dir.path().join("images")).unwrap().count(), 0);
    }

    #[test]
    fn test_stored_file_name() {
        let name = stored_file_name("holiday.JPG", Some(ImageFormat::Jpeg));
        assert_eq!(name.len(), 17 + "holiday.JPG".len());
        assert_eq!(&name[16..], "_holiday.JPG");
        assert!(name[..16].chars().all(|c| c.is_ascii_hexdigit()));

        assert!(stored_file_name("raw", Some(ImageFormat::Jpeg)).ends_with("_raw.jpg"));
        assert!(stored_file_name("...", Some(ImageFormat::Png)).ends_with("_image.png"));
        assert!(stored_file_name("a/b\\c d.png", None).ends_with("_c_d.png"));
        assert_ne!(stored_file_name("x.png", None), stored_file_name("x.png", None));
    }

    #[test]
    fn test_batched_snapshots_track_pending() {
        let dir = tempdir().unwrap();
        let mut config = ServiceConfig::from_data_dir(dir.path().to_path_buf(), 2);
        config.snapshot_every = 3;
        let coord = Coordinator::new(config, Arc::new(ByteHistogramEmbedder::new(2)));
        coord.start().unwrap();

        coord.handle_insert("a", &[0.0, 1.0]).unwrap();
        coord.handle_insert("b", &[1.0, 0.0]).unwrap();
        assert_eq!(coord.stats().unsnapshotted, 2);
        coord.handle_insert("c", &[1.0, 1.0]).unwrap();
        assert_eq!(coord.stats().unsnapshotted, 0);
        coord.handle_insert("d", &[2.0, 1.0]).unwrap();
        coord.flush().unwrap();
        assert_eq!(coord.stats().unsnapshotted, 0);
    }
}
