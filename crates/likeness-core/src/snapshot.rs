//! Snapshot persistence
//!
//! An index directory holds three artifacts:
//!
//! - `index.lkx`: vectors and graph (see [`crate::format`])
//! - `identifiers.json`: manifest with the ordered identifiers and the SHA-256
//!   of the blob it belongs to
//! - `records.wal`: records inserted since that snapshot (see [`crate::wal`])
//!
//! Saving writes both snapshot files under temporary names, syncs them, renames
//! them into place and syncs the directory. A loader only accepts a blob and
//! manifest whose checksum, counts and dimension agree, so a save interrupted
//! between the two renames surfaces as [`SnapshotError::Corrupt`] rather than
//! as a mixed snapshot.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::embed::{is_image_extension, Embedder};
use crate::format::{decode_index, encode_index, FormatError};
use crate::index::{IndexParams, SearchStrategy, SimilarityIndex};
use crate::store::VectorStore;
use crate::wal::{read_log, AppendLog, WalError};

pub const BLOB_FILE: &str = "index.lkx";
pub const MANIFEST_FILE: &str = "identifiers.json";
pub const LOG_FILE: &str = "records.wal";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("No snapshot found: {0}")]
    NotFound(String),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob format error: {0}")]
    Format(#[from] FormatError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Append log error: {0}")]
    Log(#[from] WalError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u32,
    pub dim: usize,
    pub count: usize,
    pub strategy: SearchStrategy,
    pub blob_sha256: String,
    pub identifiers: Vec<String>,
}

/// A serialized snapshot ready to be written
#[derive(Debug)]
pub struct EncodedSnapshot {
    blob: Vec<u8>,
    manifest: Vec<u8>,
    count: usize,
}

impl EncodedSnapshot {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn blob_len(&self) -> usize {
        self.blob.len()
    }
}

/// Result of a successful [`SnapshotStore::load`]
#[derive(Debug)]
pub struct Restored {
    pub index: SimilarityIndex,
    /// Records read from the snapshot files
    pub snapshot_records: usize,
    /// Records re-applied from the append log
    pub replayed: usize,
    /// Log records dropped because they did not extend this snapshot
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    /// Image files found (by extension)
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Manifest and log facts, read without loading vectors
#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub dim: usize,
    pub count: usize,
    pub strategy: SearchStrategy,
    pub blob_bytes: u64,
    pub blob_sha256: String,
    pub log_base: Option<usize>,
    pub log_records: usize,
}

/// Owner of one index directory
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    log: AppendLog,
    /// Record count of the snapshot currently on disk, once known
    snapshot_count: Option<usize>,
}

impl SnapshotStore {
    /// Open (creating if needed) the index directory `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = AppendLog::open(dir.join(LOG_FILE))?;
        Ok(Self {
            dir,
            log,
            snapshot_count: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_path(&self) -> PathBuf {
        self.dir.join(BLOB_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Records appended to the log since the last save
    pub fn pending_records(&self) -> usize {
        self.log.len()
    }

    /// True when appended records will extend the snapshot on disk
    pub fn log_in_sync(&self) -> bool {
        self.snapshot_count.is_some() && self.log.base() == self.snapshot_count
    }

    /// Serialize `index` without touching the filesystem
    pub fn encode(index: &SimilarityIndex) -> Result<EncodedSnapshot, SnapshotError> {
        let blob = encode_index(index)?;
        let manifest = SnapshotManifest {
            version: MANIFEST_VERSION,
            dim: index.dim(),
            count: index.size(),
            strategy: index.strategy(),
            blob_sha256: sha256_hex(&blob),
            identifiers: index.store().identifiers().to_vec(),
        };
        Ok(EncodedSnapshot {
            blob,
            manifest: serde_json::to_vec_pretty(&manifest)?,
            count: index.size(),
        })
    }

    /// Install an encoded snapshot and reset the log to extend it
    pub fn write(&mut self, snapshot: &EncodedSnapshot) -> Result<(), SnapshotError> {
        let blob_tmp = self.dir.join(format!(".{}.tmp", BLOB_FILE));
        let manifest_tmp = self.dir.join(format!(".{}.tmp", MANIFEST_FILE));

        write_synced(&blob_tmp, &snapshot.blob)?;
        write_synced(&manifest_tmp, &snapshot.manifest)?;
        fs::rename(&blob_tmp, self.blob_path())?;
        fs::rename(&manifest_tmp, self.manifest_path())?;
        sync_dir(&self.dir)?;

        self.snapshot_count = Some(snapshot.count);
        self.log.reset(snapshot.count)?;
        tracing::debug!(
            dir = %self.dir.display(),
            records = snapshot.count,
            blob_bytes = snapshot.blob.len(),
            "snapshot written"
        );
        Ok(())
    }

    /// Encode and write `index`
    pub fn save(&mut self, index: &SimilarityIndex) -> Result<(), SnapshotError> {
        let encoded = Self::encode(index)?;
        self.write(&encoded)
    }

    /// Log one record inserted after the current snapshot
    pub fn append_log(&mut self, identifier: &str, vector: &[f32]) -> Result<(), SnapshotError> {
        if !self.log_in_sync() {
            return Err(SnapshotError::Log(WalError::NoBase));
        }
        self.log.append(identifier, vector)?;
        Ok(())
    }

    /// Restart the log as extending a snapshot of `base` records
    pub fn reset_log(&mut self, base: usize) -> Result<(), SnapshotError> {
        self.log.reset(base)?;
        Ok(())
    }

    /// Restore the index persisted in this directory.
    ///
    /// Fails with `NotFound` when either snapshot file is missing or unreadable
    /// and `Corrupt` when they do not describe one consistent index of
    /// `params.dim` dimensions. Log records extending the snapshot are
    /// re-applied.
    pub fn load(&mut self, params: &IndexParams) -> Result<Restored, SnapshotError> {
        let blob_path = self.blob_path();
        let manifest_path = self.manifest_path();
        let blob = fs::read(&blob_path)
            .map_err(|e| SnapshotError::NotFound(format!("{}: {}", blob_path.display(), e)))?;
        let manifest_bytes = fs::read(&manifest_path)
            .map_err(|e| SnapshotError::NotFound(format!("{}: {}", manifest_path.display(), e)))?;

        let manifest: SnapshotManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| SnapshotError::Corrupt(format!("manifest unreadable: {}", e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(SnapshotError::Corrupt(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        let actual_sha = sha256_hex(&blob);
        if actual_sha != manifest.blob_sha256 {
            return Err(SnapshotError::Corrupt(format!(
                "blob checksum mismatch: manifest {}, blob {}",
                manifest.blob_sha256, actual_sha
            )));
        }

        let decoded = decode_index(&blob).map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        let count = decoded.header.count as usize;
        let dim = decoded.header.dimensions as usize;
        if count != manifest.count || count != manifest.identifiers.len() {
            return Err(SnapshotError::Corrupt(format!(
                "record count disagrees: blob {}, manifest {}, identifiers {}",
                count,
                manifest.count,
                manifest.identifiers.len()
            )));
        }
        if dim != manifest.dim {
            return Err(SnapshotError::Corrupt(format!(
                "dimension disagrees: blob {}, manifest {}",
                dim, manifest.dim
            )));
        }
        if dim != params.dim {
            return Err(SnapshotError::Corrupt(format!(
                "snapshot holds {}-dimensional vectors, configured for {}",
                dim, params.dim
            )));
        }

        let mut store = VectorStore::with_capacity(dim, count);
        if dim > 0 {
            for (vector, identifier) in decoded.vectors.chunks_exact(dim).zip(&manifest.identifiers) {
                store
                    .append(vector, identifier)
                    .map_err(|e| SnapshotError::Corrupt(format!("record {}: {}", store.size(), e)))?;
            }
        }
        if store.size() != count {
            return Err(SnapshotError::Corrupt(format!(
                "decoded {} of {} records",
                store.size(),
                count
            )));
        }

        if decoded.header.strategy != params.strategy {
            tracing::info!(
                stored = %decoded.header.strategy,
                configured = %params.strategy,
                "search strategy changed since snapshot"
            );
        }
        let mut index = SimilarityIndex::from_parts(params.clone(), store, decoded.graph);

        // The handle reopened here drops any torn tail before further appends.
        self.log = AppendLog::open(self.log_path())?;
        self.snapshot_count = Some(count);
        let (replayed, discarded) = self.replay_log(&mut index, count)?;

        tracing::info!(
            dir = %self.dir.display(),
            records = count,
            replayed,
            discarded,
            "snapshot loaded"
        );
        Ok(Restored {
            index,
            snapshot_records: count,
            replayed,
            discarded,
        })
    }

    fn replay_log(
        &self,
        index: &mut SimilarityIndex,
        count: usize,
    ) -> Result<(usize, usize), SnapshotError> {
        let contents = match read_log(&self.log_path()) {
            Ok(Some(contents)) => contents,
            Ok(None) => return Ok((0, 0)),
            Err(WalError::Header(reason)) => {
                tracing::warn!(%reason, "append log header unreadable, ignoring log");
                return Ok((0, 0));
            }
            Err(e) => return Err(e.into()),
        };

        if contents.base != count {
            tracing::warn!(
                log_base = contents.base,
                snapshot_records = count,
                records = contents.records.len(),
                "append log does not extend this snapshot, discarding it"
            );
            return Ok((0, contents.records.len()));
        }

        let mut replayed = 0;
        let mut discarded = 0;
        for record in contents.records {
            match index.insert(&record.vector, &record.identifier) {
                Ok(_) => replayed += 1,
                Err(e) => {
                    tracing::warn!(identifier = %record.identifier, error = %e, "skipping logged record");
                    discarded += 1;
                }
            }
        }
        Ok((replayed, discarded))
    }

    /// Manifest and log facts without decoding the blob
    pub fn describe(&self) -> Result<SnapshotSummary, SnapshotError> {
        let manifest_path = self.manifest_path();
        let manifest_bytes = fs::read(&manifest_path)
            .map_err(|e| SnapshotError::NotFound(format!("{}: {}", manifest_path.display(), e)))?;
        let manifest: SnapshotManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| SnapshotError::Corrupt(format!("manifest unreadable: {}", e)))?;
        let blob_bytes = fs::metadata(self.blob_path())
            .map_err(|e| SnapshotError::NotFound(e.to_string()))?
            .len();
        let (log_base, log_records) = match read_log(&self.log_path()) {
            Ok(Some(c)) => (Some(c.base), c.records.len()),
            _ => (None, 0),
        };
        Ok(SnapshotSummary {
            dim: manifest.dim,
            count: manifest.count,
            strategy: manifest.strategy,
            blob_bytes,
            blob_sha256: manifest.blob_sha256,
            log_base,
            log_records,
        })
    }

    /// Build an index from every image file in `images_dir`.
    ///
    /// Files are taken in lexicographic file-name order and registered as
    /// `<identifier_prefix>/<file name>`. Files that cannot be read, embedded
    /// or inserted are reported and skipped. A missing directory gives an
    /// empty index.
    pub fn rebuild_from_directory(
        images_dir: &Path,
        embedder: &dyn Embedder,
        params: &IndexParams,
        identifier_prefix: &str,
    ) -> Result<(SimilarityIndex, RebuildReport), SnapshotError> {
        let mut index = SimilarityIndex::new(params.clone());
        let mut report = RebuildReport::default();

        let entries = match fs::read_dir(images_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(dir = %images_dir.display(), "image directory missing, nothing to rebuild");
                return Ok((index, report));
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let has_image_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(is_image_extension);
            if !has_image_ext {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    report.scanned += 1;
                    report.skipped.push(SkippedFile {
                        file_name: raw.to_string_lossy().into_owned(),
                        reason: "file name is not valid UTF-8".to_string(),
                    });
                }
            }
        }
        names.sort();
        report.scanned += names.len();

        let prefix = identifier_prefix.trim_end_matches('/');
        for name in names {
            let identifier = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            let outcome = fs::read(images_dir.join(&name))
                .map_err(|e| e.to_string())
                .and_then(|bytes| embedder.embed(&bytes).map_err(|e| e.to_string()))
                .and_then(|vector| index.insert(&vector, &identifier).map_err(|e| e.to_string()));
            match outcome {
                Ok(_) => report.indexed += 1,
                Err(reason) => {
                    tracing::warn!(file = %name, %reason, "skipping image during rebuild");
                    report.skipped.push(SkippedFile {
                        file_name: name,
                        reason,
                    });
                }
            }
        }

        tracing::info!(
            dir = %images_dir.display(),
            scanned = report.scanned,
            indexed = report.indexed,
            skipped = report.skipped.len(),
            "rebuilt index from image directory"
        );
        Ok((index, report))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
