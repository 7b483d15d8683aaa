//! Snapshot files read by the downstream consumer.
//!
//! Features:
//! - Atomic replacement (write to `<name>.tmp`, rename into place)
//! - Refuses to replace a snapshot with an empty one
//! - Batch timestamp always normalized to `YYYY-MM-DD HH:MM:SS`
//! - BLAKE3 content hash of every written file, for change detection

use crate::timefmt::normalize_timestamp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("refusing to write empty snapshot to {}", .path.display())]
    EmptyRecords { path: PathBuf },

    #[error("snapshot I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What was written, for the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenSnapshot {
    pub path: PathBuf,
    pub bytes: usize,
    pub hash: String,
}

/// The latest-snapshot document: `{timestamp, data: {key: record}}`.
#[derive(Debug, Serialize)]
struct Snapshot<'a, R> {
    timestamp: String,
    data: &'a BTreeMap<String, R>,
}

/// Writes the keyed latest-snapshot file at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot with `records`, stamped with `batch_timestamp`.
    ///
    /// An empty `records` map leaves any previous snapshot untouched and
    /// returns [`SnapshotError::EmptyRecords`].
    pub fn write<R: Serialize>(
        &self,
        batch_timestamp: &str,
        records: &BTreeMap<String, R>,
    ) -> Result<WrittenSnapshot, SnapshotError> {
        let doc = Snapshot {
            timestamp: normalize_timestamp(batch_timestamp),
            data: records,
        };
        self.write_document(records.len(), &doc)
    }

    /// Replace the snapshot with an arbitrary document holding
    /// `record_count` records. Zero records is refused like in [`Self::write`].
    pub fn write_document<T: Serialize + ?Sized>(
        &self,
        record_count: usize,
        doc: &T,
    ) -> Result<WrittenSnapshot, SnapshotError> {
        if record_count == 0 {
            warn!(path = %self.path.display(), "no records; keeping previous snapshot");
            return Err(SnapshotError::EmptyRecords {
                path: self.path.clone(),
            });
        }
        write_json_atomic(&self.path, doc)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<WrittenSnapshot, SnapshotError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<WrittenSnapshot, SnapshotError> {
    let io_err = |source: std::io::Error| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = tmp_path_for(path);
    write_synced(&tmp_path, bytes).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        io_err(e)
    })?;

    fs::rename(&tmp_path, path).map_err(|e| {
        // Clean up temp file on rename failure
        let _ = fs::remove_file(&tmp_path);
        io_err(e)
    })?;

    let hash = blake3::hash(bytes).to_hex().to_string();
    debug!(path = %path.display(), bytes = bytes.len(), %hash, "snapshot written");
    Ok(WrittenSnapshot {
        path: path.to_path_buf(),
        bytes: bytes.len(),
        hash,
    })
}

/// Contents must be on disk before the rename, or a crash can publish an empty file.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// `latest_data.json` → `latest_data.json.tmp`, in the same directory so the
/// rename stays on one filesystem.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn records() -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("AAPL".to_string(), serde_json::json!({"close": "190.5"}));
        m.insert("MSFT".to_string(), serde_json::json!({"close": "410.25"}));
        m
    }

    #[test]
    fn writes_keyed_document() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("out/latest_data.json"));

        let written = writer.write("2025-12-24 00:13", &records()).unwrap();
        let doc: Value = serde_json::from_slice(&fs::read(&written.path).unwrap()).unwrap();

        assert_eq!(doc["timestamp"], "2025-12-24 00:13:00");
        assert_eq!(doc["data"]["AAPL"]["close"], "190.5");
        assert_eq!(doc["data"].as_object().unwrap().len(), 2);
        assert!(!dir.path().join("out/latest_data.json.tmp").exists());
    }

    #[test]
    fn empty_records_refused_and_previous_kept() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("latest_data.json"));
        writer.write("2025-12-24T00:13:56", &records()).unwrap();
        let before = fs::read(writer.path()).unwrap();

        let err = writer
            .write::<Value>("2025-12-24 00:14:00", &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::EmptyRecords { .. }));
        assert_eq!(fs::read(writer.path()).unwrap(), before);
    }

    #[test]
    fn new_snapshot_fully_replaces_old() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("latest_data.json"));
        writer.write("2025-12-24 00:13:00", &records()).unwrap();

        let mut next = BTreeMap::new();
        next.insert("NVDA".to_string(), serde_json::json!({"close": "130"}));
        writer.write("2025-12-24 00:14:00", &next).unwrap();

        let doc: Value = serde_json::from_slice(&fs::read(writer.path()).unwrap()).unwrap();
        let data = doc["data"].as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("NVDA"));
    }

    #[test]
    fn hash_matches_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        let written = write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(written.bytes, bytes.len());
        assert_eq!(written.hash, blake3::hash(&bytes).to_hex().to_string());
    }

    #[test]
    fn leftover_tmp_from_crash_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest_data.json");
        fs::write(tmp_path_for(&path), b"{\"half\":").unwrap();

        let written = write_json_atomic(&path, &serde_json::json!({"data": {"A": 1}})).unwrap();

        assert!(!tmp_path_for(&path).exists());
        let doc: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["data"]["A"], 1);
        assert_eq!(written.bytes, fs::metadata(&path).unwrap().len() as usize);
    }

    #[test]
    fn tmp_path_is_sibling() {
        assert_eq!(
            tmp_path_for(Path::new("/data/out/news_details.json")),
            PathBuf::from("/data/out/news_details.json.tmp")
        );
    }
}
