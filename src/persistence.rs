//! persistence.rs
//!
//! File-backed Test Record Store. One JSON document per record, grouped in
//! a directory per target object. Writes go to a temp file in the same
//! directory and are renamed into place, so readers never see a partial record.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::{Role, TargetObject, TestRecord, TokenUsage};
use crate::testgen::coverage::{aggregate, CoverageReport};

const RECORDS_DIR: &str = "records";
const USAGE_FILE: &str = "usage.json";

pub struct TestRecordStore {
    root: PathBuf,
    open: AtomicBool,
    usage: Mutex<BTreeMap<String, TokenUsage>>,
}

impl TestRecordStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let records = root.join(RECORDS_DIR);
        fs::create_dir_all(&records).map_err(|e| io_err(&records, e))?;

        let usage_path = root.join(USAGE_FILE);
        let usage = match fs::read_to_string(&usage_path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                path: usage_path.clone(),
                source: e,
            })?,
            Err(_) => BTreeMap::new(),
        };

        debug!(root = %root.display(), "record store opened");
        Ok(Self {
            root,
            open: AtomicBool::new(true),
            usage: Mutex::new(usage),
        })
    }

    /// Per-project store location under the user data dir.
    pub fn default_path(project_root: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(project_root.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.push("testsmith");
        base.push("projects");
        base.push(&hash[..16]);
        base
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self, record: &TestRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        check_record_id(&record.object_id, &record.id)?;

        let dir = self.object_dir(&record.object_id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{}.json", record.id));
        write_atomic(&dir, &path, record)?;

        info!(object = %record.object_id, id = %record.id, accepted = record.accepted, "record stored");
        Ok(())
    }

    pub fn read(&self, object_id: &str, record_id: &str) -> Result<TestRecord, StoreError> {
        self.ensure_open()?;
        check_record_id(object_id, record_id)?;

        let path = self.object_dir(object_id).join(format!("{record_id}.json"));
        if !path.exists() {
            return Err(StoreError::NotFound {
                object_id: object_id.into(),
                record_id: record_id.into(),
            });
        }
        read_record(&path)
    }

    /// Records of one object, oldest first.
    pub fn list(&self, object_id: &str) -> Result<Vec<TestRecord>, StoreError> {
        self.ensure_open()?;
        let mut out = read_dir_records(&self.object_dir(object_id))?;
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    pub fn list_all(&self) -> Result<Vec<TestRecord>, StoreError> {
        self.ensure_open()?;
        let base = self.root.join(RECORDS_DIR);
        let mut out = Vec::new();
        let entries = fs::read_dir(&base).map_err(|e| io_err(&base, e))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                out.extend(read_dir_records(&entry.path())?);
            }
        }
        out.sort_by(|a, b| a.object_id.cmp(&b.object_id).then(a.created_at.cmp(&b.created_at)));
        Ok(out)
    }

    /// Lookup by test id alone.
    pub fn find(&self, record_id: &str) -> Result<TestRecord, StoreError> {
        self.list_all()?
            .into_iter()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StoreError::NotFound {
                object_id: "*".into(),
                record_id: record_id.into(),
            })
    }

    pub fn delete(&self, object_id: &str, record_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        check_record_id(object_id, record_id)?;

        let path = self.object_dir(object_id).join(format!("{record_id}.json"));
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(object = %object_id, id = %record_id, "record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                object_id: object_id.into(),
                record_id: record_id.into(),
            }),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Replaces a stored test's source after a manual edit. The last
    /// assistant message of the stored exchange is rewritten too.
    pub fn update_source(
        &self,
        object_id: &str,
        record_id: &str,
        source: &str,
    ) -> Result<TestRecord, StoreError> {
        let mut record = self.read(object_id, record_id)?;
        record.test_source = source.to_string();
        if let Some(m) = record.messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
            m.content = source.to_string();
        }

        let dir = self.object_dir(object_id);
        write_atomic(&dir, &dir.join(format!("{record_id}.json")), &record)?;
        Ok(record)
    }

    /// Accumulated coverage over the accepted tests of `target`.
    pub fn coverage(&self, target: &TargetObject) -> Result<CoverageReport, StoreError> {
        let object_id = target.id();
        let accepted: Vec<TestRecord> = self
            .list(&object_id)?
            .into_iter()
            .filter(|r| r.accepted)
            .collect();
        Ok(aggregate(&object_id, target.span, &accepted))
    }

    pub fn record_usage(&self, model: &str, usage: TokenUsage) -> Result<(), StoreError> {
        self.ensure_open()?;
        // Held through the write so files land in the same order as updates.
        let mut guard = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        guard.entry(model.to_string()).or_default().add(usage);
        write_atomic(&self.root, &self.root.join(USAGE_FILE), &*guard)
    }

    pub fn usage(&self) -> BTreeMap<String, TokenUsage> {
        self.usage.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Flushes usage counters and rejects further operations. Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        write_atomic(&self.root, &self.root.join(USAGE_FILE), &*guard)?;
        drop(guard);
        debug!(root = %self.root.display(), "record store closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn object_dir(&self, object_id: &str) -> PathBuf {
        let mut h = Sha256::new();
        h.update(object_id.as_bytes());
        let key = hex::encode(h.finalize());
        self.root.join(RECORDS_DIR).join(&key[..16])
    }
}

impl Drop for TestRecordStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "record store close failed");
        }
    }
}

fn write_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    tmp.write_all(text.as_bytes()).map_err(|e| io_err(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

fn read_record(path: &Path) -> Result<TestRecord, StoreError> {
    let raw = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_dir_records(dir: &Path) -> Result<Vec<TestRecord>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir, e)),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(read_record(&path)?);
        }
    }
    Ok(out)
}

/// Record ids become file names.
fn check_record_id(object_id: &str, record_id: &str) -> Result<(), StoreError> {
    let ok = !record_id.is_empty()
        && record_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::NotFound {
            object_id: object_id.into(),
            record_id: record_id.into(),
        })
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
