//! Append log of records inserted since the last snapshot
//!
//! JSON lines. The first line is a header naming the snapshot size (`base`)
//! the records extend; each following line is one `(identifier, vector)`
//! record in insertion order:
//!
//! ```text
//! {"likeness_wal":1,"base":42}
//! {"identifier":"static/images/x.png","vector":[0.1,0.2,...]}
//! ```
//!
//! A crash mid-append leaves at most one partial line at the end. Reading stops
//! at the first line that does not parse, and opening for append cuts the file
//! back to the last complete record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WAL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid log header: {0}")]
    Header(String),

    #[error("Log has no base snapshot; reset it before appending")]
    NoBase,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    likeness_wal: u32,
    base: usize,
}

/// One logged insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub identifier: String,
    pub vector: Vec<f32>,
}

/// Everything readable from a log file
#[derive(Debug)]
pub struct LogContents {
    pub base: usize,
    pub records: Vec<LogRecord>,
    /// Length of the well-formed prefix (header plus complete records)
    pub valid_len: u64,
    /// Bytes after `valid_len` that were ignored
    pub torn_bytes: u64,
}

/// Read a log; `Ok(None)` when the file does not exist
pub fn read_log(path: &Path) -> Result<Option<LogContents>, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let total_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 || !line.ends_with('\n') {
        return Err(WalError::Header("missing or incomplete header line".to_string()));
    }
    let header: Header =
        serde_json::from_str(line.trim_end()).map_err(|e| WalError::Header(e.to_string()))?;
    if header.likeness_wal != WAL_VERSION {
        return Err(WalError::Header(format!(
            "unsupported log version {}",
            header.likeness_wal
        )));
    }

    let mut valid_len = n as u64;
    let mut records = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 || !line.ends_with('\n') {
            break;
        }
        match serde_json::from_str::<LogRecord>(line.trim_end()) {
            Ok(record) => {
                records.push(record);
                valid_len += n as u64;
            }
            Err(_) => break,
        }
    }

    Ok(Some(LogContents {
        base: header.base,
        records,
        valid_len,
        torn_bytes: total_len - valid_len,
    }))
}

/// Writable handle to the append log
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    base: Option<usize>,
    records: usize,
    /// Byte length of the log up to the last complete record
    valid_len: u64,
}

impl AppendLog {
    /// Open the log at `path`, cutting any torn tail.
    ///
    /// A missing or unreadable log yields a handle with no base; it must be
    /// [`reset`](Self::reset) before records can be appended.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let (base, records, valid_len) = match read_log(&path) {
            Ok(Some(contents)) => {
                if contents.torn_bytes > 0 {
                    tracing::warn!(
                        path = %path.display(),
                        torn_bytes = contents.torn_bytes,
                        "dropping incomplete tail of append log"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(contents.valid_len)?;
                    file.sync_all()?;
                }
                (Some(contents.base), contents.records.len(), contents.valid_len)
            }
            Ok(None) => (None, 0, 0),
            Err(WalError::Header(reason)) => {
                tracing::warn!(path = %path.display(), %reason, "ignoring unreadable append log");
                (None, 0, 0)
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            base,
            records,
            valid_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot size the logged records extend
    pub fn base(&self) -> Option<usize> {
        self.base
    }

    /// Records appended since the last reset
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Append and sync one record.
    ///
    /// Bytes past the last complete record, such as the fragment of an
    /// earlier failed append, are cut before writing. A failed write is cut
    /// back the same way; if that cut fails too the handle loses its base and
    /// refuses appends until the next [`reset`](Self::reset).
    pub fn append(&mut self, identifier: &str, vector: &[f32]) -> Result<(), WalError> {
        if self.base.is_none() {
            return Err(WalError::NoBase);
        }
        let record = LogRecord {
            identifier: identifier.to_string(),
            vector: vector.to_vec(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let on_disk = file.metadata()?.len();
        if on_disk != self.valid_len {
            tracing::warn!(
                path = %self.path.display(),
                expected = self.valid_len,
                on_disk,
                "append log length drifted, cutting back to last record"
            );
            if let Err(e) = file.set_len(self.valid_len) {
                self.base = None;
                return Err(e.into());
            }
        }

        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            if file.set_len(self.valid_len).and_then(|()| file.sync_data()).is_err() {
                tracing::error!(
                    path = %self.path.display(),
                    "could not cut failed append; log disabled until reset"
                );
                self.base = None;
            }
            return Err(e.into());
        }
        self.valid_len += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Replace the log with an empty one extending a snapshot of `base` records
    pub fn reset(&mut self, base: usize) -> Result<(), WalError> {
        let mut header = serde_json::to_string(&Header {
            likeness_wal: WAL_VERSION,
            base,
        })?;
        header.push('\n');

        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(header.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.base = Some(base);
        self.records = 0;
        self.valid_len = header.len() as u64;
        Ok(())
    }
}
